//! Pausable timers on the session clock.
//!
//! Neither type owns a clock or a callback. A [`Countdown`] is a single
//! deadline slot: re-arming or disarming overwrites it, so an old deadline
//! cannot fire after the step that armed it has ended.

use trialflow_core::{Millis, SessionTime};

/// A cancellable, freezable deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Countdown {
    /// No timer
    #[default]
    Disarmed,
    /// Fires at `deadline`
    Armed {
        /// When the countdown elapses
        deadline: SessionTime,
    },
    /// Paused with time left
    Frozen {
        /// Time left when frozen
        remaining: Millis,
    },
}

impl Countdown {
    /// Start counting `duration` from `now`
    #[must_use]
    pub fn armed(now: SessionTime, duration: Millis) -> Self {
        Self::Armed {
            deadline: now.after(duration),
        }
    }

    /// Replace any pending deadline
    pub fn arm(&mut self, now: SessionTime, duration: Millis) {
        *self = Self::armed(now, duration);
    }

    /// Clear the slot
    pub fn disarm(&mut self) {
        *self = Self::Disarmed;
    }

    /// Stop the clock, keeping the time left
    ///
    /// Returns `false` unless the countdown was armed.
    pub fn freeze(&mut self, now: SessionTime) -> bool {
        match *self {
            Self::Armed { deadline } => {
                *self = Self::Frozen {
                    remaining: deadline.since(now),
                };
                true
            }
            Self::Disarmed | Self::Frozen { .. } => false,
        }
    }

    /// Restart from the frozen remaining time
    ///
    /// Returns `false` unless the countdown was frozen.
    pub fn thaw(&mut self, now: SessionTime) -> bool {
        match *self {
            Self::Frozen { remaining } => {
                self.arm(now, remaining);
                true
            }
            Self::Disarmed | Self::Armed { .. } => false,
        }
    }

    /// Pending deadline, if running
    #[must_use]
    pub fn deadline(&self) -> Option<SessionTime> {
        match self {
            Self::Armed { deadline } => Some(*deadline),
            Self::Disarmed | Self::Frozen { .. } => None,
        }
    }

    /// Time left, if armed or frozen
    #[must_use]
    pub fn remaining(&self, now: SessionTime) -> Option<Millis> {
        match self {
            Self::Armed { deadline } => Some(deadline.since(now)),
            Self::Frozen { remaining } => Some(*remaining),
            Self::Disarmed => None,
        }
    }

    /// Whether the deadline has been reached
    #[must_use]
    pub fn is_due(&self, now: SessionTime) -> bool {
        self.deadline().is_some_and(|deadline| deadline <= now)
    }

    /// Check if frozen
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        matches!(self, Self::Frozen { .. })
    }
}

/// Accumulating stopwatch that can be paused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stopwatch {
    accumulated: Millis,
    running_since: Option<SessionTime>,
}

impl Stopwatch {
    /// A stopwatch already running from `now`
    #[must_use]
    pub fn started(now: SessionTime) -> Self {
        Self {
            accumulated: Millis::ZERO,
            running_since: Some(now),
        }
    }

    /// Stop accumulating
    pub fn pause(&mut self, now: SessionTime) {
        if let Some(since) = self.running_since.take() {
            self.accumulated = self.accumulated.saturating_add(now.since(since));
        }
    }

    /// Continue accumulating
    pub fn resume(&mut self, now: SessionTime) {
        if self.running_since.is_none() {
            self.running_since = Some(now);
        }
    }

    /// Total running time up to `now`
    #[must_use]
    pub fn elapsed(&self, now: SessionTime) -> Millis {
        match self.running_since {
            Some(since) => self.accumulated.saturating_add(now.since(since)),
            None => self.accumulated,
        }
    }

    /// Check if running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> SessionTime {
        SessionTime::from_millis(ms)
    }

    #[test]
    fn test_countdown_arm_and_due() {
        let c = Countdown::armed(at(100), Millis::new(1000));
        assert_eq!(c.deadline(), Some(at(1100)));
        assert!(!c.is_due(at(1099)));
        assert!(c.is_due(at(1100)));
        assert_eq!(c.remaining(at(600)), Some(Millis::new(500)));
    }

    #[test]
    fn test_countdown_freeze_keeps_remaining() {
        let mut c = Countdown::armed(at(0), Millis::new(2000));
        assert!(c.freeze(at(1600)));
        assert!(c.is_frozen());
        assert_eq!(c.deadline(), None);
        assert!(!c.is_due(at(100_000)));
        assert_eq!(c.remaining(at(100_000)), Some(Millis::new(400)));

        assert!(c.thaw(at(5000)));
        assert_eq!(c.deadline(), Some(at(5400)));
        assert!(!c.thaw(at(5000)));
    }

    #[test]
    fn test_countdown_disarm() {
        let mut c = Countdown::armed(at(0), Millis::new(10));
        c.disarm();
        assert!(!c.is_due(at(50)));
        assert_eq!(c.remaining(at(0)), None);
        assert!(!c.freeze(at(0)));
    }

    #[test]
    fn test_stopwatch_excludes_paused_time() {
        let mut w = Stopwatch::started(at(1000));
        assert_eq!(w.elapsed(at(1250)), Millis::new(250));
        w.pause(at(1300));
        assert!(!w.is_running());
        assert_eq!(w.elapsed(at(9000)), Millis::new(300));
        w.resume(at(9000));
        assert_eq!(w.elapsed(at(9100)), Millis::new(400));
    }
}
