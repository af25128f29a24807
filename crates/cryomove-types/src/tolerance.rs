//! Tolerances and time bounds used by composites and safety checks.
//!
//! These are plain configuration values threaded through construction, so
//! tests and deployments can tighten or relax them per instance.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerances {
    /// Absolute tolerance on linear axes (m) when comparing to a favourite
    /// position.
    pub linear_atol: f64,
    /// Absolute tolerance on rotation axes (rad).
    pub rotation_atol: f64,
    /// Relative tolerance for "is on the loading path".
    pub progress_rtol: f64,
    /// Extra margin, as a fraction of the range width, accepted around an
    /// active range.
    pub active_range_margin: f64,
    /// Upper bound on a single orchestrated sub-move, in seconds.
    pub max_submove_duration_s: f64,
    /// Upper bound on waiting for a child to stop, in seconds.
    pub stop_timeout_s: f64,
    /// Discrepancy between a raw reading and a declared fixed position above
    /// which a warning is logged.
    pub fixed_position_atol: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            linear_atol: 100e-6,
            rotation_atol: 1e-3,
            progress_rtol: 0.1,
            active_range_margin: 0.01,
            max_submove_duration_s: 60.0,
            stop_timeout_s: 1.0,
            fixed_position_atol: 1e-6,
        }
    }
}

impl Tolerances {
    pub fn max_submove_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.max_submove_duration_s).unwrap_or(Duration::from_secs(60))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.stop_timeout_s).unwrap_or(Duration::from_secs(1))
    }

    pub fn with_max_submove_duration(mut self, d: Duration) -> Self {
        self.max_submove_duration_s = d.as_secs_f64();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_hardware_limits() {
        let t = Tolerances::default();
        assert_eq!(t.max_submove_duration(), Duration::from_secs(60));
        assert_eq!(t.stop_timeout(), Duration::from_secs(1));
        assert!((t.linear_atol - 100e-6).abs() < 1e-12);
    }

    #[test]
    fn invalid_durations_fall_back() {
        let t = Tolerances {
            max_submove_duration_s: -3.0,
            stop_timeout_s: f64::NAN,
            ..Tolerances::default()
        };
        assert_eq!(t.max_submove_duration(), Duration::from_secs(60));
        assert_eq!(t.stop_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn partial_table_keeps_other_defaults() {
        let t: Tolerances = serde_json::from_str(r#"{"rotation_atol": 0.01}"#).unwrap();
        assert_eq!(t.rotation_atol, 0.01);
        assert_eq!(t.progress_rtol, 0.1);
    }
}
