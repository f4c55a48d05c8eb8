use serde::{Deserialize, Serialize};

/// Fixed-precision monetary amount in minor currency units (paise).
///
/// Stored as a signed integer so arithmetic never loses precision; the
/// major-unit view is only used for display and scoring heuristics.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize, Hash,
)]
#[serde(transparent)]
pub struct Money(pub i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn from_major(major: i64) -> Self {
        Money(major * 100)
    }

    pub fn minor(self) -> i64 {
        self.0
    }

    /// Whole major units, truncated toward zero.
    pub fn major(self) -> i64 {
        self.0 / 100
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_add(self, other: Money) -> Money {
        Money(self.0.saturating_add(other.0))
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, (self.0 % 100).abs())
    }
}
