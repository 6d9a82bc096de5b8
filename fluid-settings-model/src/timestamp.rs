//! Nanosecond wall-clock timestamps.
//!
//! Timestamps order concurrent writes to the same `(name, priority)` pair:
//! the larger timestamp wins. A sanity floor guards against peers whose
//! clock is wildly behind; the store refuses records older than the floor.

use crate::ModelError;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default refusal floor for stored timestamps: 2022-07-21T00:00:00Z.
/// Deployments with older archives can lower it on the store.
pub const DEFAULT_FLOOR: Timestamp = Timestamp(1_658_361_600_000_000_000);

/// Nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(since_epoch.as_nanos().min(i64::MAX as u128) as i64)
    }

    /// Parse the wire form (a decimal count of nanoseconds).
    pub fn parse(text: &str) -> Result<Self, ModelError> {
        text.trim()
            .parse()
            .map(Self)
            .map_err(|_| ModelError::InvalidTimestamp(text.to_string()))
    }

    pub const fn as_nanos(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
