//! Playback engine for compiled timelines.
//!
//! The engine is a plain state machine. It never sleeps or reads a clock:
//! every call takes the current [`SessionTime`], and the caller drives
//! timers by calling [`PlaybackEngine::poll`] at or after
//! [`PlaybackEngine::next_deadline`]. Leaving a step always clears the step
//! countdown and every collector, so a deadline belonging to a step that has
//! already ended can never fire.

use crate::collector::{Collector, ParticipantInput, ResponseEvent, ResponseSink};
use crate::countdown::Countdown;
use crate::monitor::{SessionMetrics, SessionOutcome, SessionReport};
use serde::Serialize;
use std::sync::Arc;
use trialflow_core::{CoreError, CoreResult, Millis, SessionId, SessionTime};
use trialflow_plan::{CompileOptions, Compiler, DurationPolicy, Graph, Step, Timeline};

/// Playback engine configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Step duration defaults
    pub durations: DurationPolicy,
    /// Used by [`PlaybackEngine::start_graph`]
    pub compile: CompileOptions,
}

impl EngineConfig {
    /// Create default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the duration policy
    #[must_use]
    pub fn with_durations(mut self, durations: DurationPolicy) -> Self {
        self.durations = durations;
        self
    }

    /// Set the compile options
    #[must_use]
    pub fn with_compile_options(mut self, compile: CompileOptions) -> Self {
        self.compile = compile;
        self
    }
}

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// No session
    Idle,
    /// A step is live
    Running,
    /// Clocks frozen, input ignored
    Paused,
    /// Played past the last step
    Completed,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Why a step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Countdown elapsed
    TimerElapsed,
    /// Skipped by the operator
    Skipped,
    /// A collector recorded a response or timed out
    Responded,
    /// Continue button on an instruction
    Continued,
    /// Step had no members
    Empty,
}

/// Something that happened during playback
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlaybackEvent {
    /// Timeline pinned, first step about to start
    SessionStarted {
        /// Session ID
        session: SessionId,
        /// Steps in the timeline
        step_count: usize,
        /// Session clock
        at: SessionTime,
    },
    /// A step became active
    StepStarted {
        /// Step index
        index: usize,
        /// Countdown, if the step is timed
        duration: Option<Millis>,
        /// Session clock
        at: SessionTime,
    },
    /// A step ended
    StepEnded {
        /// Step index
        index: usize,
        /// Why
        reason: EndReason,
        /// Session clock
        at: SessionTime,
    },
    /// A collector recorded a value
    Response(ResponseEvent),
    /// Session paused
    Paused {
        /// Step index
        index: usize,
        /// Countdown time left
        remaining: Option<Millis>,
        /// Session clock
        at: SessionTime,
    },
    /// Session resumed
    Resumed {
        /// Step index
        index: usize,
        /// Session clock
        at: SessionTime,
    },
    /// Played past the last step
    Completed {
        /// Session ID
        session: SessionId,
        /// Session clock
        at: SessionTime,
    },
    /// Stopped early
    Stopped {
        /// Session ID
        session: SessionId,
        /// Session clock
        at: SessionTime,
    },
}

/// Read-only view for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackStatus {
    /// Engine state
    pub state: PlaybackState,
    /// Index of the live step
    pub active_step_index: usize,
    /// Steps in the pinned timeline
    pub step_count: usize,
    /// Countdown time left; `None` for untimed steps
    pub remaining_time: Option<Millis>,
    /// Convenience flag for `state == Paused`
    pub is_paused: bool,
}

impl PlaybackStatus {
    fn idle(state: PlaybackState) -> Self {
        Self {
            state,
            active_step_index: 0,
            step_count: 0,
            remaining_time: None,
            is_paused: false,
        }
    }
}

/// One run of a pinned timeline
struct Session {
    id: SessionId,
    timeline: Arc<Timeline>,
    index: usize,
    countdown: Countdown,
    collectors: Vec<Collector>,
    responses: Vec<ResponseEvent>,
    metrics: SessionMetrics,
    started_at: SessionTime,
    paused_at: Option<SessionTime>,
}

impl Session {
    fn report(self, outcome: SessionOutcome, ended_at: SessionTime) -> SessionReport {
        SessionReport {
            session_id: self.id,
            outcome,
            started_at: self.started_at,
            ended_at,
            step_count: self.timeline.len(),
            responses: self.responses,
            metrics: self.metrics,
        }
    }

    fn next_deadline(&self) -> Option<SessionTime> {
        self.collectors
            .iter()
            .filter_map(Collector::deadline)
            .chain(self.countdown.deadline())
            .min()
    }
}

/// Playback engine
///
/// Owns the session: step index, countdown and collectors are only ever
/// changed through `&mut self` calls, one transition at a time.
pub struct PlaybackEngine {
    config: EngineConfig,
    state: PlaybackState,
    session: Option<Session>,
    events: Vec<PlaybackEvent>,
    sink: Option<Box<dyn ResponseSink>>,
    report: Option<SessionReport>,
}

impl PlaybackEngine {
    /// Create a new engine
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            state: PlaybackState::Idle,
            session: None,
            events: Vec::new(),
            sink: None,
            report: None,
        }
    }

    /// Deliver every response to `sink` as well as to the event queue
    #[must_use]
    pub fn with_response_sink(mut self, sink: impl ResponseSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Replace the response sink
    pub fn set_response_sink(&mut self, sink: impl ResponseSink + 'static) {
        self.sink = Some(Box::new(sink));
    }

    /// Pin `timeline` and activate its first step
    ///
    /// # Errors
    ///
    /// Returns error if a session is running or paused
    pub fn start(&mut self, timeline: impl Into<Arc<Timeline>>, now: SessionTime) -> CoreResult<SessionId> {
        if matches!(self.state, PlaybackState::Running | PlaybackState::Paused) {
            return Err(CoreError::InvalidState {
                operation: "start".to_string(),
                state: self.state.to_string(),
            });
        }

        let timeline = timeline.into();
        let id = SessionId::new();
        tracing::info!(session = %id, steps = timeline.len(), "session started");

        self.report = None;
        self.events.push(PlaybackEvent::SessionStarted {
            session: id,
            step_count: timeline.len(),
            at: now,
        });
        self.session = Some(Session {
            id,
            timeline,
            index: 0,
            countdown: Countdown::Disarmed,
            collectors: Vec::new(),
            responses: Vec::new(),
            metrics: SessionMetrics::new(),
            started_at: now,
            paused_at: None,
        });
        self.state = PlaybackState::Running;
        self.activate(now);
        Ok(id)
    }

    /// Compile `graph` with the configured options, then start
    ///
    /// # Errors
    ///
    /// Returns error if a session is running or paused
    pub fn start_graph(&mut self, graph: &Graph, now: SessionTime) -> CoreResult<SessionId> {
        if matches!(self.state, PlaybackState::Running | PlaybackState::Paused) {
            return Err(CoreError::InvalidState {
                operation: "start".to_string(),
                state: self.state.to_string(),
            });
        }
        let output = Compiler::with_options(self.config.compile).compile_graph(graph);
        self.start(output.timeline, now)
    }

    /// Fire every deadline due at `now`, in deadline order
    ///
    /// Returns the number of steps that ended.
    pub fn poll(&mut self, now: SessionTime) -> usize {
        let mut fired = 0;
        while self.state == PlaybackState::Running {
            let Some(session) = self.session.as_mut() else {
                break;
            };

            let collector_due = session
                .collectors
                .iter()
                .enumerate()
                .filter_map(|(i, c)| c.deadline().map(|d| (d, i)))
                .filter(|(d, _)| *d <= now)
                .min();
            let step_due = session.countdown.deadline().filter(|d| *d <= now);

            match (collector_due, step_due) {
                // a collector timing out together with the step still records its value
                (Some((at, i)), step) if step.is_none_or(|s| at <= s) => {
                    if let Some(event) = session.collectors[i].expire(at) {
                        self.record_response(event);
                    }
                    self.end_step(EndReason::Responded, at);
                }
                (_, Some(at)) => self.end_step(EndReason::TimerElapsed, at),
                _ => break,
            }
            fired += 1;
        }
        fired
    }

    /// Offer participant input to the live step
    ///
    /// Returns `true` if the input ended the step.
    pub fn input(&mut self, input: ParticipantInput, now: SessionTime) -> bool {
        self.poll(now);
        if self.state != PlaybackState::Running {
            tracing::debug!(state = %self.state, "input ignored");
            return false;
        }
        let Some(session) = self.session.as_mut() else {
            return false;
        };

        let response = session.collectors.iter_mut().find_map(|c| c.offer(&input, now));
        if let Some(event) = response {
            self.record_response(event);
            self.end_step(EndReason::Responded, now);
            return true;
        }

        let awaits_continue = session
            .timeline
            .get(session.index)
            .is_some_and(Step::awaits_continue);
        if input == ParticipantInput::Continue && awaits_continue {
            self.end_step(EndReason::Continued, now);
            return true;
        }
        false
    }

    /// End the live step now
    ///
    /// Returns `false` unless running.
    pub fn skip(&mut self, now: SessionTime) -> bool {
        if self.state != PlaybackState::Running {
            return false;
        }
        self.end_step(EndReason::Skipped, now);
        true
    }

    /// Freeze the countdown and every collector
    ///
    /// Returns `false` unless running.
    pub fn pause(&mut self, now: SessionTime) -> bool {
        self.poll(now);
        if self.state != PlaybackState::Running {
            return false;
        }
        let Some(session) = self.session.as_mut() else {
            return false;
        };

        session.countdown.freeze(now);
        for collector in &mut session.collectors {
            collector.freeze(now);
        }
        session.paused_at = Some(now);
        session.metrics.record_pause();

        let remaining = session.countdown.remaining(now);
        tracing::debug!(step = session.index, ?remaining, "paused");
        self.events.push(PlaybackEvent::Paused {
            index: session.index,
            remaining,
            at: now,
        });
        self.state = PlaybackState::Paused;
        true
    }

    /// Restart the countdown from the time left at pause
    ///
    /// Returns `false` unless paused.
    pub fn resume(&mut self, now: SessionTime) -> bool {
        if self.state != PlaybackState::Paused {
            return false;
        }
        let Some(session) = self.session.as_mut() else {
            return false;
        };

        session.countdown.thaw(now);
        for collector in &mut session.collectors {
            collector.thaw(now);
        }
        if let Some(paused_at) = session.paused_at.take() {
            session.metrics.record_resume(now.since(paused_at));
        }

        tracing::debug!(step = session.index, "resumed");
        self.events.push(PlaybackEvent::Resumed {
            index: session.index,
            at: now,
        });
        self.state = PlaybackState::Running;
        true
    }

    /// Cancel everything and return to idle
    ///
    /// Returns the report of the session that was live or had just completed.
    pub fn stop(&mut self, now: SessionTime) -> Option<SessionReport> {
        let previous = self.state;
        self.state = PlaybackState::Idle;
        match previous {
            PlaybackState::Running | PlaybackState::Paused => {
                let session = self.session.take()?;
                tracing::info!(session = %session.id, step = session.index, "session stopped");
                self.events.push(PlaybackEvent::Stopped {
                    session: session.id,
                    at: now,
                });
                Some(session.report(SessionOutcome::Stopped, now))
            }
            PlaybackState::Completed => self.report.take(),
            PlaybackState::Idle => None,
        }
    }

    /// Earliest pending deadline while running
    #[must_use]
    pub fn next_deadline(&self) -> Option<SessionTime> {
        if self.state != PlaybackState::Running {
            return None;
        }
        self.session.as_ref().and_then(Session::next_deadline)
    }

    /// Current status
    #[must_use]
    pub fn status(&self, now: SessionTime) -> PlaybackStatus {
        match &self.session {
            Some(session) => PlaybackStatus {
                state: self.state,
                active_step_index: session.index,
                step_count: session.timeline.len(),
                remaining_time: session.countdown.remaining(now),
                is_paused: self.state == PlaybackState::Paused,
            },
            None => PlaybackStatus::idle(self.state),
        }
    }

    /// The live step
    #[must_use]
    pub fn active_step(&self) -> Option<&Step> {
        let session = self.session.as_ref()?;
        session.timeline.get(session.index)
    }

    /// Engine state
    #[must_use]
    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// The pinned timeline
    #[must_use]
    pub fn timeline(&self) -> Option<Arc<Timeline>> {
        self.session.as_ref().map(|s| Arc::clone(&s.timeline))
    }

    /// Events since the last drain
    pub fn drain_events(&mut self) -> Vec<PlaybackEvent> {
        std::mem::take(&mut self.events)
    }

    /// Report of the last completed session
    pub fn take_report(&mut self) -> Option<SessionReport> {
        self.report.take()
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Activate the step at the session index, skipping empty steps
    fn activate(&mut self, at: SessionTime) {
        loop {
            let Some(session) = self.session.as_mut() else {
                return;
            };
            let timeline = Arc::clone(&session.timeline);
            let Some(step) = timeline.get(session.index) else {
                self.complete(at);
                return;
            };

            session.metrics.record_step_started();
            if step.is_empty() {
                tracing::debug!(step = session.index, "empty step");
                self.events.push(PlaybackEvent::StepStarted {
                    index: session.index,
                    duration: None,
                    at,
                });
                self.events.push(PlaybackEvent::StepEnded {
                    index: session.index,
                    reason: EndReason::Empty,
                    at,
                });
                session.metrics.empty_steps += 1;
                session.index += 1;
                continue;
            }

            let duration = self.config.durations.step_duration(step);
            match duration {
                Some(duration) => session.countdown.arm(at, duration),
                None => session.countdown.disarm(),
            }
            session.collectors = step
                .members
                .iter()
                .filter_map(|node| {
                    node.collection()
                        .map(|settings| Collector::attach(node.id.clone(), &settings, at))
                })
                .collect();

            tracing::debug!(
                step = session.index,
                members = step.members.len(),
                ?duration,
                collectors = session.collectors.len(),
                "step started"
            );
            self.events.push(PlaybackEvent::StepStarted {
                index: session.index,
                duration,
                at,
            });
            return;
        }
    }

    fn end_step(&mut self, reason: EndReason, at: SessionTime) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.countdown.disarm();
        session.collectors.clear();
        match reason {
            EndReason::TimerElapsed => session.metrics.steps_elapsed += 1,
            EndReason::Skipped => session.metrics.steps_skipped += 1,
            EndReason::Responded => session.metrics.steps_responded += 1,
            EndReason::Continued => session.metrics.steps_continued += 1,
            EndReason::Empty => session.metrics.empty_steps += 1,
        }
        tracing::debug!(step = session.index, ?reason, "step ended");
        self.events.push(PlaybackEvent::StepEnded {
            index: session.index,
            reason,
            at,
        });
        session.index += 1;
        self.activate(at);
    }

    fn complete(&mut self, at: SessionTime) {
        let Some(session) = self.session.take() else {
            return;
        };
        tracing::info!(session = %session.id, steps = session.timeline.len(), "session completed");
        self.events.push(PlaybackEvent::Completed {
            session: session.id,
            at,
        });
        self.report = Some(session.report(SessionOutcome::Completed, at));
        self.state = PlaybackState::Completed;
    }

    fn record_response(&mut self, event: ResponseEvent) {
        if let Some(sink) = self.sink.as_mut() {
            sink.on_response(&event);
        }
        if let Some(session) = self.session.as_mut() {
            tracing::debug!(node = %event.node_id, value = %event.value, elapsed = %event.elapsed_time, "response");
            session.metrics.record_response(&event);
            session.responses.push(event.clone());
        }
        self.events.push(PlaybackEvent::Response(event));
    }
}

impl Default for PlaybackEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl std::fmt::Debug for PlaybackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackEngine")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("step", &self.session.as_ref().map(|s| s.index))
            .field("pending_events", &self.events.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{Point, ResponseValue};
    use serde_json::json;
    use std::sync::Mutex;
    use trialflow_plan::{Edge, Node, StepOrigin};

    fn at(ms: u64) -> SessionTime {
        SessionTime::from_millis(ms)
    }

    fn node(value: serde_json::Value) -> Node {
        serde_json::from_value(value).unwrap()
    }

    fn stimulus(id: &str, duration: u64) -> Node {
        node(json!({ "id": id, "type": "stimulus", "data": { "duration": duration } }))
    }

    fn timeline(steps: Vec<Vec<Node>>) -> Timeline {
        Timeline::new(steps.into_iter().map(|m| Step::new(m, StepOrigin::Trivial)).collect())
    }

    fn ended(events: &[PlaybackEvent]) -> Vec<(usize, EndReason)> {
        events
            .iter()
            .filter_map(|e| match e {
                PlaybackEvent::StepEnded { index, reason, .. } => Some((*index, *reason)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_engine_new() {
        let engine = PlaybackEngine::default();
        assert_eq!(engine.state(), PlaybackState::Idle);
        assert_eq!(engine.next_deadline(), None);
        assert_eq!(engine.status(at(0)), PlaybackStatus::idle(PlaybackState::Idle));
    }

    #[test]
    fn test_chained_sequences_play_through() {
        let mut graph = Graph::new();
        let a = node(json!({ "id": "sequence-0", "type": "sequence", "data": {} }));
        let b = node(json!({ "id": "sequence-1", "type": "sequence", "data": {} }));
        let s1 = stimulus("stimulus-2", 500);
        let r1 = node(json!({ "id": "response-3", "type": "response", "data": { "timeout": 2000 } }));
        let i1 = node(json!({ "id": "instruction-4", "type": "instruction", "data": { "showContinueButton": true } }));
        for n in [a, b, s1, r1, i1] {
            graph.add_node(n).unwrap();
        }
        graph.add_edge(Edge::containment("sequence-0", "stimulus-2")).unwrap();
        graph.add_edge(Edge::containment("sequence-0", "response-3")).unwrap();
        graph.add_edge(Edge::containment("sequence-1", "instruction-4")).unwrap();
        graph.add_edge(Edge::chain("sequence-0", "sequence-1")).unwrap();

        let mut engine = PlaybackEngine::default();
        engine.start_graph(&graph, at(0)).unwrap();
        assert_eq!(engine.status(at(0)).step_count, 2);
        assert_eq!(engine.status(at(0)).remaining_time, Some(Millis::new(2000)));

        // the response node's own timeout coincides with the step timer
        assert_eq!(engine.poll(at(2000)), 1);
        let status = engine.status(at(2000));
        assert_eq!(status.active_step_index, 1);
        assert_eq!(status.remaining_time, None);
        assert_eq!(engine.next_deadline(), None);

        assert!(!engine.input(ParticipantInput::Key("a".into()), at(9000)));
        assert!(engine.input(ParticipantInput::Continue, at(9500)));
        assert_eq!(engine.state(), PlaybackState::Completed);

        let report = engine.take_report().unwrap();
        assert!(report.is_complete());
        assert_eq!(report.responses.len(), 1);
        assert!(report.responses[0].value.is_timeout());
        assert_eq!(report.metrics.steps_continued, 1);
        assert_eq!(report.ended_at, at(9500));
    }

    #[test]
    fn test_pause_resumes_from_remaining_time() {
        let mut engine = PlaybackEngine::default();
        engine.start(timeline(vec![vec![stimulus("s", 1000)]]), at(0)).unwrap();

        assert!(engine.pause(at(600)));
        let status = engine.status(at(600));
        assert!(status.is_paused);
        assert_eq!(status.remaining_time, Some(Millis::new(400)));
        assert_eq!(engine.next_deadline(), None);
        assert_eq!(engine.poll(at(5000)), 0);

        assert!(engine.resume(at(5000)));
        assert_eq!(engine.next_deadline(), Some(at(5400)));
        assert_eq!(engine.poll(at(5399)), 0);
        assert_eq!(engine.poll(at(5400)), 1);
        assert_eq!(engine.state(), PlaybackState::Completed);
        assert_eq!(engine.take_report().unwrap().metrics.paused_time, Millis::new(4400));
    }

    #[test]
    fn test_skip_leaves_no_stale_timer() {
        let mut engine = PlaybackEngine::default();
        engine
            .start(timeline(vec![vec![stimulus("a", 1000)], vec![stimulus("b", 1000)]]), at(0))
            .unwrap();

        assert!(engine.skip(at(300)));
        assert_eq!(engine.next_deadline(), Some(at(1300)));
        // the first step's deadline passes without effect
        assert_eq!(engine.poll(at(1000)), 0);
        assert_eq!(engine.status(at(1000)).active_step_index, 1);

        assert_eq!(engine.poll(at(1300)), 1);
        assert_eq!(
            ended(&engine.drain_events()),
            vec![(0, EndReason::Skipped), (1, EndReason::TimerElapsed)]
        );
    }

    #[test]
    fn test_empty_steps_advance_immediately() {
        let mut engine = PlaybackEngine::default();
        engine
            .start(timeline(vec![Vec::new(), Vec::new(), vec![stimulus("s", 1500)]]), at(10))
            .unwrap();
        assert_eq!(engine.status(at(10)).active_step_index, 2);
        assert_eq!(engine.next_deadline(), Some(at(1510)));

        let mut only_empty = PlaybackEngine::default();
        only_empty.start(timeline(vec![Vec::new()]), at(0)).unwrap();
        assert_eq!(only_empty.state(), PlaybackState::Completed);
    }

    #[test]
    fn test_empty_timeline_completes() {
        let mut engine = PlaybackEngine::default();
        engine.start(Timeline::default(), at(0)).unwrap();
        assert_eq!(engine.state(), PlaybackState::Completed);
        assert!(engine.stop(at(1)).is_some());
        assert_eq!(engine.state(), PlaybackState::Idle);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let mut engine = PlaybackEngine::default();
        engine.start(timeline(vec![vec![stimulus("s", 1000)]]), at(0)).unwrap();
        let result = engine.start(Timeline::default(), at(1));
        assert!(matches!(result, Err(CoreError::InvalidState { .. })));

        engine.pause(at(2));
        assert!(engine.start(Timeline::default(), at(3)).is_err());
    }

    #[test]
    fn test_transitions_outside_source_state_are_noops() {
        let mut engine = PlaybackEngine::default();
        assert!(!engine.pause(at(0)));
        assert!(!engine.resume(at(0)));
        assert!(!engine.skip(at(0)));
        assert!(engine.stop(at(0)).is_none());

        engine.start(timeline(vec![vec![stimulus("s", 1000)]]), at(0)).unwrap();
        assert!(!engine.resume(at(10)));
        assert!(engine.pause(at(20)));
        assert!(!engine.pause(at(30)));
        assert!(!engine.skip(at(40)));
    }

    #[test]
    fn test_keyboard_response_advances() {
        let responder = node(json!({
            "id": "stimulus-0",
            "type": "stimulus",
            "data": { "duration": 4000, "collectResponse": true, "validResponses": "f,j" }
        }));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let mut engine = PlaybackEngine::default().with_response_sink(move |event: &ResponseEvent| {
            sink_seen.lock().unwrap().push(event.clone());
        });
        engine
            .start(timeline(vec![vec![responder], vec![stimulus("next", 1000)]]), at(0))
            .unwrap();

        assert!(!engine.input(ParticipantInput::Key("x".into()), at(100)));
        assert!(engine.input(ParticipantInput::Key("j".into()), at(640)));
        assert_eq!(engine.status(at(640)).active_step_index, 1);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].elapsed_time, Millis::new(640));
        assert_eq!(seen[0].value, ResponseValue::Key("j".into()));
    }

    #[test]
    fn test_paused_collectors_ignore_input() {
        let clicker = node(json!({
            "id": "response-0",
            "type": "response",
            "data": { "responseType": "mouse", "timeout": 5000 }
        }));
        let mut engine = PlaybackEngine::default();
        engine.start(timeline(vec![vec![clicker]]), at(0)).unwrap();

        engine.pause(at(200));
        assert!(!engine.input(ParticipantInput::Click(Point::new(1.0, 1.0)), at(300)));
        engine.resume(at(1200));
        assert!(engine.input(ParticipantInput::Click(Point::new(5.0, 6.0)), at(1300)));

        let report = engine.take_report().unwrap();
        assert_eq!(report.responses[0].elapsed_time, Millis::new(300));
        assert_eq!(report.responses[0].value.to_string(), "5,6");
    }

    #[test]
    fn test_collector_timeout_ends_step_early() {
        let listener = node(json!({
            "id": "stimulus-0",
            "type": "stimulus",
            "data": { "duration": 8000, "collectResponse": true, "responseTimeout": 1500 }
        }));
        let mut engine = PlaybackEngine::default();
        engine.start(timeline(vec![vec![listener]]), at(0)).unwrap();
        assert_eq!(engine.next_deadline(), Some(at(1500)));
        assert_eq!(engine.poll(at(1500)), 1);

        let events = engine.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            PlaybackEvent::Response(r) if r.value.is_timeout() && r.elapsed_time == Millis::new(1500)
        )));
        assert_eq!(ended(&events), vec![(0, EndReason::Responded)]);
    }

    #[test]
    fn test_late_poll_fires_every_due_deadline() {
        let mut engine = PlaybackEngine::default();
        engine
            .start(
                timeline(vec![vec![stimulus("a", 1000)], vec![stimulus("b", 1000)], vec![stimulus("c", 1000)]]),
                at(0),
            )
            .unwrap();
        assert_eq!(engine.poll(at(2500)), 2);
        assert_eq!(engine.status(at(2500)).active_step_index, 2);
        assert_eq!(engine.next_deadline(), Some(at(3000)));
    }

    #[test]
    fn test_stop_returns_report_and_resets() {
        let mut engine = PlaybackEngine::default();
        engine
            .start(timeline(vec![vec![stimulus("a", 1000)], vec![stimulus("b", 1000)]]), at(0))
            .unwrap();
        engine.poll(at(1000));

        let report = engine.stop(at(1200)).unwrap();
        assert_eq!(report.outcome, SessionOutcome::Stopped);
        assert_eq!(report.metrics.steps_started, 2);
        assert_eq!(engine.state(), PlaybackState::Idle);
        assert!(engine.timeline().is_none());
        assert_eq!(engine.status(at(1300)).active_step_index, 0);
        assert_eq!(engine.poll(at(5000)), 0);
    }

    #[test]
    fn test_timeline_is_pinned() {
        let mut graph = Graph::new();
        graph.add_node(stimulus("a", 1000)).unwrap();
        let mut engine = PlaybackEngine::default();
        engine.start_graph(&graph, at(0)).unwrap();

        graph.add_node(stimulus("b", 1000)).unwrap();
        assert_eq!(engine.status(at(0)).step_count, 1);
    }
}
