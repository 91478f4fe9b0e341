//! Aggregate version counter used for optimistic concurrency.

use serde::{Deserialize, Serialize};

/// Monotonically increasing row version carried by every aggregate root.
///
/// A freshly created aggregate starts at [`Version::INITIAL`]. Each
/// successful update advances the stored value by exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// The version assigned on creation.
    pub const INITIAL: Self = Self(1);

    /// Wrap a raw stored version.
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Return the raw stored value.
    pub const fn get(self) -> i64 {
        self.0
    }

    /// The version that follows this one, or `None` on overflow.
    pub const fn next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::INITIAL
    }
}

impl core::fmt::Display for Version {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one() {
        assert_eq!(Version::default().get(), 1);
    }

    #[test]
    fn next_increments_by_one() {
        assert_eq!(Version::new(7).next(), Some(Version::new(8)));
    }

    #[test]
    fn next_saturates_to_none() {
        assert_eq!(Version::new(i64::MAX).next(), None);
    }
}
