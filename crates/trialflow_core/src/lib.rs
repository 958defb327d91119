//! TRIALFLOW Core Types
//!
//! Pure types shared by the planner, the runtime, and storage.
//! Nothing in this crate performs I/O or reads a clock.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod id;
pub mod time;
pub mod version;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use id::{EdgeId, NodeId, SessionId};
pub use time::{Millis, SessionTime};
pub use version::{Version, VersionError};
