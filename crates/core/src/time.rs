//! Timestamps and the clock abstraction.
//!
//! Timestamps carry their timezone offset and microsecond precision. The
//! textual form is fixed (`2023-12-24 17:21:15.520646+03:00`) so that encoded
//! records round-trip losslessly.

use std::sync::Mutex;

use chrono::{DateTime, Duration, FixedOffset, SubsecRound, Utc};

use crate::error::{DomainError, DomainResult};

/// Point in time with a fixed UTC offset.
pub type Timestamp = DateTime<FixedOffset>;

const FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f%:z";
const PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f%:z";

/// Render a timestamp in the canonical textual form.
pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.format(FORMAT).to_string()
}

/// Parse the canonical textual form.
pub fn parse_timestamp(s: &str) -> DomainResult<Timestamp> {
    DateTime::parse_from_str(s, PARSE_FORMAT)
        .map_err(|e| DomainError::validation(format!("invalid timestamp '{s}': {e}")))
}

/// Truncate to the precision preserved by the textual form.
pub fn normalize(ts: Timestamp) -> Timestamp {
    ts.trunc_subsecs(6)
}

/// Serde adapter for `Timestamp` fields (`#[serde(with = "timestamp")]`).
pub mod timestamp {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{Timestamp, format_timestamp, parse_timestamp};

    pub fn serialize<S: Serializer>(ts: &Timestamp, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Timestamp, D::Error> {
        let raw = String::deserialize(d)?;
        parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }

    /// Same adapter for `Option<Timestamp>` (encoded as null when absent).
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        use super::super::{Timestamp, format_timestamp, parse_timestamp};

        pub fn serialize<S: Serializer>(ts: &Option<Timestamp>, s: S) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => s.serialize_some(&format_timestamp(ts)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Timestamp>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|raw| parse_timestamp(&raw).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

/// Source of "now" for domain transitions.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}

/// Wall clock, in UTC.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        normalize(Utc::now().fixed_offset())
    }
}

/// Manually driven clock for deterministic tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<Timestamp>,
}

impl FixedClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: Mutex::new(normalize(now)),
        }
    }

    pub fn set(&self, now: Timestamp) {
        *self.lock() = normalize(now);
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.lock();
        *now = normalize(*now + by);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Timestamp> {
        // A poisoned clock still holds a valid timestamp.
        self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        *self.lock()
    }
}
