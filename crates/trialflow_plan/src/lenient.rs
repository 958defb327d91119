//! Lenient payload fields.
//!
//! Authoring snapshots are hand-editable JSON, so a field can hold a value of
//! the wrong type. A [`Lenient`] field keeps whatever was written so the
//! snapshot round-trips byte-for-value, while readers only ever see a typed
//! value or "absent".

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value};
use trialflow_core::Millis;

/// A payload field that is missing, well-typed, or holds an unusable value
#[derive(Debug, Clone, PartialEq)]
pub enum Lenient<T> {
    /// Key not present
    Missing,
    /// Value parsed as `T`
    Valid(T),
    /// Value present but not a `T`; kept verbatim
    Invalid(Value),
}

impl<T> Default for Lenient<T> {
    fn default() -> Self {
        Self::Missing
    }
}

impl<T> Lenient<T> {
    /// Get the typed value, if any
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        match self {
            Self::Valid(value) => Some(value),
            Self::Missing | Self::Invalid(_) => None,
        }
    }

    /// Whether the key was absent
    #[must_use]
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }
}

impl<T: Clone> Lenient<T> {
    /// Get the typed value or a fallback
    #[must_use]
    pub fn get_or(&self, fallback: T) -> T {
        self.get().cloned().unwrap_or(fallback)
    }
}

impl Lenient<bool> {
    /// Read a flag, treating anything but `true` as unset
    #[must_use]
    pub fn is_set(&self) -> bool {
        matches!(self, Self::Valid(true))
    }
}

impl Lenient<Number> {
    /// Read a strictly positive duration, rounding fractional milliseconds
    #[must_use]
    pub fn positive_millis(&self) -> Option<Millis> {
        let value = self.get()?.as_f64()?;
        if value.is_finite() && value > 0.0 {
            Some(Millis::new(value.round().min(u64::MAX as f64) as u64))
        } else {
            None
        }
    }

    /// Read any finite number
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        self.get()?.as_f64().filter(|v| v.is_finite())
    }
}

impl Lenient<String> {
    /// Read a string, empty when unset
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.get().map_or("", String::as_str)
    }
}

impl<T> From<T> for Lenient<T> {
    fn from(value: T) -> Self {
        Self::Valid(value)
    }
}

impl<T: Serialize> Serialize for Lenient<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Valid(value) => value.serialize(serializer),
            Self::Invalid(raw) => raw.serialize(serializer),
            Self::Missing => serializer.serialize_none(),
        }
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Lenient<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(match serde_json::from_value::<T>(raw.clone()) {
            Ok(value) => Self::Valid(value),
            Err(_) => Self::Invalid(raw),
        })
    }
}

/// Build a JSON number from an integer literal
#[must_use]
pub fn number(value: u64) -> Lenient<Number> {
    Lenient::Valid(Number::from(value))
}
