//! Participant response collection.
//!
//! One [`Collector`] is attached per listening member of the active step.
//! It answers at most once: with the first qualifying input, or with a
//! synthetic timeout when its own deadline passes first.

use crate::countdown::{Countdown, Stopwatch};
use serde::{Serialize, Serializer};
use trialflow_core::{Millis, NodeId, SessionTime};
use trialflow_plan::{Collection, InputMode};

/// Screen coordinates of a click or touch
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    /// Horizontal coordinate
    pub x: f64,
    /// Vertical coordinate
    pub y: f64,
}

impl Point {
    /// Create a new point
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl std::fmt::Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

/// Raw input from the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum ParticipantInput {
    /// Key press, by key name (`"a"`, `"ArrowLeft"`, `" "`)
    Key(String),
    /// Pointer click
    Click(Point),
    /// Touch start with every active touch point
    Touch(Vec<Point>),
    /// On-screen continue button
    Continue,
}

/// What a collector recorded
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseValue {
    /// Key name
    Key(String),
    /// Click or first touch coordinates
    Point(Point),
    /// Continue button
    Continue,
    /// Nothing qualifying before the collector's deadline
    Timeout,
}

impl ResponseValue {
    /// Check for the synthetic timeout value
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl std::fmt::Display for ResponseValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Key(key) => f.write_str(key),
            Self::Point(point) => point.fmt(f),
            Self::Continue => f.write_str("continue"),
            Self::Timeout => f.write_str("timeout"),
        }
    }
}

impl Serialize for ResponseValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One recorded response
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEvent {
    /// Node that collected it
    pub node_id: NodeId,
    /// Time since the step became active, pauses excluded
    pub elapsed_time: Millis,
    /// Recorded value
    pub value: ResponseValue,
}

/// Receives every response as it is recorded
pub trait ResponseSink: Send {
    /// Called once per response, before the step advances
    fn on_response(&mut self, event: &ResponseEvent);
}

impl<F> ResponseSink for F
where
    F: FnMut(&ResponseEvent) + Send,
{
    fn on_response(&mut self, event: &ResponseEvent) {
        self(event);
    }
}

/// Listener for one member of the active step
#[derive(Debug, Clone)]
pub struct Collector {
    node_id: NodeId,
    mode: InputMode,
    allowed_keys: Vec<String>,
    timeout: Countdown,
    stopwatch: Stopwatch,
    answered: bool,
}

impl Collector {
    /// Attach at step activation; the stopwatch and the timeout start at `now`
    #[must_use]
    pub fn attach(node_id: NodeId, settings: &Collection, now: SessionTime) -> Self {
        Self {
            node_id,
            mode: settings.mode,
            allowed_keys: settings.allowed_keys.clone(),
            timeout: Countdown::armed(now, settings.timeout),
            stopwatch: Stopwatch::started(now),
            answered: false,
        }
    }

    /// Node this collector belongs to
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Input mode
    #[must_use]
    pub fn mode(&self) -> InputMode {
        self.mode
    }

    /// Listening: not answered and not paused
    #[must_use]
    pub fn is_listening(&self) -> bool {
        !self.answered && !self.timeout.is_frozen()
    }

    /// Map an input to a value if it qualifies for this collector's mode
    #[must_use]
    pub fn qualify(&self, input: &ParticipantInput) -> Option<ResponseValue> {
        match (self.mode, input) {
            (InputMode::Keyboard, ParticipantInput::Key(key)) => {
                let allowed = self.allowed_keys.is_empty() || self.allowed_keys.iter().any(|k| k == key);
                allowed.then(|| ResponseValue::Key(key.clone()))
            }
            (InputMode::Mouse, ParticipantInput::Click(point)) => Some(ResponseValue::Point(*point)),
            (InputMode::Touch, ParticipantInput::Touch(points)) => {
                points.first().map(|p| ResponseValue::Point(*p))
            }
            (InputMode::Button, ParticipantInput::Continue) => Some(ResponseValue::Continue),
            _ => None,
        }
    }

    /// Offer an input; the first qualifying one is recorded
    pub fn offer(&mut self, input: &ParticipantInput, now: SessionTime) -> Option<ResponseEvent> {
        if !self.is_listening() {
            return None;
        }
        let value = self.qualify(input)?;
        Some(self.answer(value, now))
    }

    /// Record the synthetic timeout if the deadline has passed
    pub fn expire(&mut self, now: SessionTime) -> Option<ResponseEvent> {
        if self.answered || !self.timeout.is_due(now) {
            return None;
        }
        Some(self.answer(ResponseValue::Timeout, now))
    }

    /// Pending timeout deadline
    #[must_use]
    pub fn deadline(&self) -> Option<SessionTime> {
        if self.answered {
            None
        } else {
            self.timeout.deadline()
        }
    }

    /// Stop listening and freeze both clocks
    pub fn freeze(&mut self, now: SessionTime) {
        self.timeout.freeze(now);
        self.stopwatch.pause(now);
    }

    /// Resume listening from where the clocks stopped
    pub fn thaw(&mut self, now: SessionTime) {
        self.timeout.thaw(now);
        self.stopwatch.resume(now);
    }

    fn answer(&mut self, value: ResponseValue, now: SessionTime) -> ResponseEvent {
        self.answered = true;
        self.timeout.disarm();
        self.stopwatch.pause(now);
        ResponseEvent {
            node_id: self.node_id.clone(),
            elapsed_time: self.stopwatch.elapsed(now),
            value,
        }
    }
}
