//! Priority Tiers
//!
//! Requests are queued in one of three tiers. The numeric values double as
//! the priority term of the scheduler score, so they are part of the contract.

use serde::{Deserialize, Serialize};

/// Priority tier of a queued request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work, served after everything else
    Low = 1,
    /// Default tier
    #[default]
    Normal = 5,
    /// Interactive work, served first
    High = 10,
}

impl Priority {
    /// All tiers, highest first (dequeue order)
    pub const DESCENDING: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Map an integer to a tier, falling back to `Normal`
    #[must_use]
    pub fn from_int(value: i64) -> Self {
        match value {
            1 => Self::Low,
            5 => Self::Normal,
            10 => Self::High,
            _ => Self::Normal,
        }
    }

    /// Parse a tier name or number, falling back to `Normal`
    #[must_use]
    pub fn from_string(s: &str) -> Self {
        let s = s.trim();
        match s.to_lowercase().as_str() {
            "low" => Self::Low,
            "normal" => Self::Normal,
            "high" => Self::High,
            other => other.parse::<i64>().map_or(Self::Normal, Self::from_int),
        }
    }

    /// Numeric value of the tier
    #[must_use]
    pub fn value(self) -> u8 {
        self as u8
    }

    /// Index into per-tier storage (0 = low, 2 = high)
    #[must_use]
    pub(crate) fn tier_index(self) -> usize {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
        }
    }

    /// Lower-case label
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value().cmp(&other.value())
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}
