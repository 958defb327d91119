//! TRIALFLOW Runtime
//!
//! Playback engine for compiled timelines: pausable step countdowns,
//! participant response collection, and an async driver on the tokio clock.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod countdown;
pub mod collector;
pub mod monitor;
pub mod engine;
pub mod driver;

pub use countdown::{Countdown, Stopwatch};
pub use collector::{Collector, ParticipantInput, Point, ResponseEvent, ResponseSink, ResponseValue};
pub use monitor::{SessionMetrics, SessionOutcome, SessionReport};
pub use engine::{EndReason, EngineConfig, PlaybackEngine, PlaybackEvent, PlaybackState, PlaybackStatus};
pub use driver::{spawn_session, SessionCommand, SessionHandle};
