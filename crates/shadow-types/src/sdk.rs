//! Platform SDK levels.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type SdkLevel = u32;

/// Newest level the runner knows about.
pub const LATEST_SDK: SdkLevel = 34;

/// Oldest level the runner supports.
pub const OLDEST_SDK: SdkLevel = 21;

/// Inclusive range of SDK levels. An open `max` means "no upper bound".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SdkRange {
    pub min: SdkLevel,
    #[serde(default)]
    pub max: Option<SdkLevel>,
}

impl SdkRange {
    pub const ALL: SdkRange = SdkRange { min: 0, max: None };

    pub fn new(min: SdkLevel, max: Option<SdkLevel>) -> Self {
        Self { min, max }
    }

    pub fn at_least(min: SdkLevel) -> Self {
        Self { min, max: None }
    }

    pub fn contains(&self, sdk: SdkLevel) -> bool {
        sdk >= self.min && self.max.map_or(true, |max| sdk <= max)
    }
}

impl Default for SdkRange {
    fn default() -> Self {
        Self::ALL
    }
}

impl fmt::Display for SdkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) => write!(f, "[{}..={}]", self.min, max),
            None => write!(f, "[{}..]", self.min),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdk_range_contains() {
        let range = SdkRange::new(23, Some(28));
        assert!(!range.contains(22));
        assert!(range.contains(23));
        assert!(range.contains(28));
        assert!(!range.contains(29));

        assert!(SdkRange::at_least(30).contains(LATEST_SDK));
        assert!(SdkRange::ALL.contains(OLDEST_SDK));
        assert_eq!(range.to_string(), "[23..=28]");
    }
}
