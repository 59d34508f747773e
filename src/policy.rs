//! Redaction predicates composed into a retain/suppress verdict.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default lower speed gate, about 5 mph
pub const DEFAULT_MIN_SPEED_MPS: f64 = 2.235;

/// Default upper speed gate, about 100 mph
pub const DEFAULT_MAX_SPEED_MPS: f64 = 44.7;

/// How geofence containment maps to retention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Retain only vehicles inside the geofence
    Inclusive,
    /// Retain only vehicles outside the geofence
    Exclusive,
}

impl FromStr for FilterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inclusive" => Ok(FilterMode::Inclusive),
            "exclusive" => Ok(FilterMode::Exclusive),
            other => Err(format!("unknown filter mode \"{}\"", other)),
        }
    }
}

/// Why a message was suppressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuppressReason {
    OutsideGeofence,
    SpeedOutOfRange,
    InvalidId,
    ParseError,
    MissingRequired,
}

impl SuppressReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressReason::OutsideGeofence => "outside-geofence",
            SuppressReason::SpeedOutOfRange => "speed-out-of-range",
            SuppressReason::InvalidId => "invalid-id",
            SuppressReason::ParseError => "parse-error",
            SuppressReason::MissingRequired => "missing-required",
        }
    }
}

impl fmt::Display for SuppressReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the decision pipeline for one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Retain,
    Suppress(SuppressReason),
}

/// The configured predicates of the privacy filter
#[derive(Debug, Clone)]
pub struct FilterPolicy {
    pub mode: FilterMode,
    pub min_speed_mps: f64,
    pub max_speed_mps: f64,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self {
            mode: FilterMode::Inclusive,
            min_speed_mps: DEFAULT_MIN_SPEED_MPS,
            max_speed_mps: DEFAULT_MAX_SPEED_MPS,
        }
    }
}

impl FilterPolicy {
    pub fn speed_in_range(&self, speed_mps: f64) -> bool {
        speed_mps >= self.min_speed_mps && speed_mps <= self.max_speed_mps
    }

    /// Apply the configured geofence mode to a containment result
    pub fn retains_position(&self, contained: bool) -> bool {
        match self.mode {
            FilterMode::Inclusive => contained,
            FilterMode::Exclusive => !contained,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("inclusive".parse::<FilterMode>(), Ok(FilterMode::Inclusive));
        assert_eq!("exclusive".parse::<FilterMode>(), Ok(FilterMode::Exclusive));
        assert!("both".parse::<FilterMode>().is_err());
    }

    #[test]
    fn test_speed_gate_defaults() {
        let policy = FilterPolicy::default();
        assert!(policy.speed_in_range(10.0));
        assert!(policy.speed_in_range(DEFAULT_MIN_SPEED_MPS));
        assert!(policy.speed_in_range(DEFAULT_MAX_SPEED_MPS));
        assert!(!policy.speed_in_range(0.5));
        assert!(!policy.speed_in_range(50.0));
    }

    #[test]
    fn test_geofence_mode() {
        let inclusive = FilterPolicy::default();
        assert!(inclusive.retains_position(true));
        assert!(!inclusive.retains_position(false));

        let exclusive = FilterPolicy {
            mode: FilterMode::Exclusive,
            ..FilterPolicy::default()
        };
        assert!(!exclusive.retains_position(true));
        assert!(exclusive.retains_position(false));
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(SuppressReason::OutsideGeofence.to_string(), "outside-geofence");
        assert_eq!(SuppressReason::ParseError.to_string(), "parse-error");
    }
}
