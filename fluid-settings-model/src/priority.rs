//! Setting priorities.
//!
//! Each stored value carries a priority in `0..=99`. Several values may
//! coexist for one name, one per priority, and a plain GET returns the one
//! with the largest priority. The conventional bands:
//! - `0`: service defaults
//! - `1..=49`: application overrides
//! - `50`: administrator
//! - `51..=99`: application overrides that beat the administrator

use crate::ModelError;
use std::fmt;

/// Service defaults.
pub const DEFAULTS: Priority = Priority(0);

/// The priority the administrator edits; also the PUT/DELETE default.
pub const ADMINISTRATOR: Priority = Priority(50);

/// Smallest storable priority.
pub const MINIMUM: Priority = Priority(0);

/// Largest storable priority.
pub const MAXIMUM: Priority = Priority(99);

/// A storable priority, always within `0..=99`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    /// Build a priority, rejecting out-of-range values.
    pub fn new(priority: i64) -> Result<Self, ModelError> {
        if !(i64::from(MINIMUM.0)..=i64::from(MAXIMUM.0)).contains(&priority) {
            return Err(ModelError::PriorityOutOfRange(priority));
        }
        Ok(Self(priority as u8))
    }

    /// Parse the wire form of a priority parameter.
    pub fn parse(text: &str) -> Result<Self, ModelError> {
        let n: i64 = text
            .trim()
            .parse()
            .map_err(|_| ModelError::InvalidPriority(text.to_string()))?;
        Self::new(n)
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A priority as used by queries: either a concrete stored priority or the
/// largest one currently stored. The `-1` wire sentinel maps to `Highest`
/// and never reaches storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityQuery {
    Highest,
    At(Priority),
}
