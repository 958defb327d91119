//! Time types for TRIALFLOW.
//!
//! The runtime never reads a clock directly. Callers pass a [`SessionTime`]
//! (milliseconds since the session clock's origin) into every operation,
//! which keeps playback deterministic under test.

use serde::{Deserialize, Serialize};

/// A span of time in whole milliseconds
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Millis(u64);

impl Millis {
    /// Zero duration
    pub const ZERO: Self = Self(0);

    /// Create from milliseconds
    #[must_use]
    pub const fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Create from whole seconds
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000))
    }

    /// Get raw milliseconds
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Get as fractional seconds
    #[must_use]
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000.0
    }

    /// Check for zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Saturating subtraction
    #[must_use]
    pub const fn saturating_sub(self, other: Millis) -> Millis {
        Millis(self.0.saturating_sub(other.0))
    }

    /// Saturating addition
    #[must_use]
    pub const fn saturating_add(self, other: Millis) -> Millis {
        Millis(self.0.saturating_add(other.0))
    }

    /// Convert to a std duration
    #[must_use]
    pub const fn to_std(self) -> std::time::Duration {
        std::time::Duration::from_millis(self.0)
    }
}

impl From<u64> for Millis {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<std::time::Duration> for Millis {
    fn from(value: std::time::Duration) -> Self {
        Self(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }
}

impl std::fmt::Display for Millis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A point on the session clock, in milliseconds since its origin
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SessionTime(u64);

impl SessionTime {
    /// The clock origin
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Create from milliseconds since origin
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Milliseconds since origin
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// The point `span` after this one
    #[must_use]
    pub const fn after(self, span: Millis) -> Self {
        Self(self.0.saturating_add(span.as_u64()))
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future
    #[must_use]
    pub const fn since(self, earlier: SessionTime) -> Millis {
        Millis::new(self.0.saturating_sub(earlier.0))
    }
}

impl std::fmt::Display for SessionTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T+{}ms", self.0)
    }
}
