//! Loop-closure and claim eligibility.
//!
//! A pure function of the track and the session mode. The controller re-runs it
//! after every append or snap merge, so a snapshot is never stale.

use serde::{Deserialize, Serialize};

use crate::geo_utils::{haversine_distance, polyline_length};
use crate::{best_estimate_track, Fix, TrackingMode};

/// Claim rules. These are game policy, not physical limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EligibilityConfig {
    /// Minimum time between first and last fix. Default: 600 seconds
    pub min_elapsed_seconds: i64,

    /// Minimum number of recorded fixes. Default: 50
    pub min_points: usize,

    /// Maximum start-to-end distance for a closed loop. Default: 20.0 meters
    pub closure_threshold_m: f64,

    /// Minimum perimeter for walk/run sessions. Default: 200.0 meters
    pub walk_run_min_perimeter_m: f64,

    /// Minimum perimeter for cycling sessions. Default: 1000.0 meters
    pub cycle_min_perimeter_m: f64,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            min_elapsed_seconds: 600,
            min_points: 50,
            closure_threshold_m: 20.0,
            walk_run_min_perimeter_m: 200.0,
            cycle_min_perimeter_m: 1000.0,
        }
    }
}

impl EligibilityConfig {
    /// Perimeter floor for a mode.
    pub fn min_perimeter_m(&self, mode: TrackingMode) -> f64 {
        match mode {
            TrackingMode::WalkRun => self.walk_run_min_perimeter_m,
            TrackingMode::Cycle => self.cycle_min_perimeter_m,
        }
    }
}

/// Derived view of a track against the claim rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EligibilitySnapshot {
    pub elapsed_seconds: i64,
    pub point_count: usize,
    pub path_length_m: f64,
    pub closure_distance_m: Option<f64>,
    pub close_enough: bool,
    pub perimeter_estimate_m: f64,
    pub claimable: bool,
}

/// Evaluate a track against the claim rules.
///
/// Distances use best-estimate coordinates. Elapsed time uses the raw
/// timestamps of the first and last fix, rounded to the nearest second.
pub fn evaluate(
    fixes: &[Fix],
    mode: TrackingMode,
    config: &EligibilityConfig,
) -> EligibilitySnapshot {
    let best = best_estimate_track(fixes);
    let point_count = fixes.len();

    let elapsed_seconds = match (fixes.first(), fixes.last()) {
        (Some(first), Some(last)) => rounded_seconds(last.timestamp - first.timestamp),
        _ => 0,
    };

    if best.len() < 2 {
        return EligibilitySnapshot {
            elapsed_seconds,
            point_count,
            ..EligibilitySnapshot::default()
        };
    }

    let path_length_m = polyline_length(&best);
    let closure = haversine_distance(&best[0], &best[best.len() - 1]);
    let close_enough = closure <= config.closure_threshold_m;

    // An open path has no perimeter to speak of beyond its length.
    let perimeter_estimate_m = if close_enough {
        path_length_m + closure
    } else {
        path_length_m
    };

    let claimable = elapsed_seconds >= config.min_elapsed_seconds
        && point_count >= config.min_points
        && close_enough
        && perimeter_estimate_m >= config.min_perimeter_m(mode);

    EligibilitySnapshot {
        elapsed_seconds,
        point_count,
        path_length_m,
        closure_distance_m: Some(closure),
        close_enough,
        perimeter_estimate_m,
        claimable,
    }
}

/// Whole seconds in `span`, rounded half up and clamped at zero.
pub(crate) fn rounded_seconds(span: chrono::Duration) -> i64 {
    (span.num_milliseconds().max(0) as f64 / 1000.0).round() as i64
}
