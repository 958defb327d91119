//! Session metrics and the end-of-session report.

use crate::collector::ResponseEvent;
use serde::Serialize;
use trialflow_core::{Millis, SessionId, SessionTime};

/// Counters kept while a session runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    /// Steps activated
    pub steps_started: u64,
    /// Steps ended by their countdown
    pub steps_elapsed: u64,
    /// Steps ended by skip
    pub steps_skipped: u64,
    /// Steps ended by a response (including timeouts)
    pub steps_responded: u64,
    /// Steps ended by the continue button
    pub steps_continued: u64,
    /// Steps with no members
    pub empty_steps: u64,
    /// Responses recorded
    pub responses: u64,
    /// Of which synthetic timeouts
    pub timeouts: u64,
    /// Times the session was paused
    pub pauses: u64,
    /// Total time spent paused
    pub paused_time: Millis,
}

impl SessionMetrics {
    /// Create new metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step activation
    pub fn record_step_started(&mut self) {
        self.steps_started += 1;
    }

    /// Record a response
    pub fn record_response(&mut self, event: &ResponseEvent) {
        self.responses += 1;
        if event.value.is_timeout() {
            self.timeouts += 1;
        }
    }

    /// Record a pause
    pub fn record_pause(&mut self) {
        self.pauses += 1;
    }

    /// Record the length of a finished pause
    pub fn record_resume(&mut self, paused_for: Millis) {
        self.paused_time = self.paused_time.saturating_add(paused_for);
    }

    /// Steps that have ended, for any reason
    #[must_use]
    pub fn steps_ended(&self) -> u64 {
        self.steps_elapsed + self.steps_skipped + self.steps_responded + self.steps_continued + self.empty_steps
    }

    /// Share of responses that were timeouts (0.0 - 1.0)
    #[must_use]
    pub fn timeout_rate(&self) -> f64 {
        if self.responses == 0 {
            return 0.0;
        }
        self.timeouts as f64 / self.responses as f64
    }

    /// Reset metrics
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Played past the last step
    Completed,
    /// Stopped early
    Stopped,
}

/// Summary handed back when a session ends
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    /// Session ID
    pub session_id: SessionId,
    /// How it ended
    pub outcome: SessionOutcome,
    /// Session clock at start
    pub started_at: SessionTime,
    /// Session clock at the end
    pub ended_at: SessionTime,
    /// Steps in the pinned timeline
    pub step_count: usize,
    /// Every response, in order
    pub responses: Vec<ResponseEvent>,
    /// Counters
    pub metrics: SessionMetrics,
}

impl SessionReport {
    /// Wall time from start to end, pauses included
    #[must_use]
    pub fn duration(&self) -> Millis {
        self.ended_at.since(self.started_at)
    }

    /// Check if the whole timeline played
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.outcome == SessionOutcome::Completed
    }
}
