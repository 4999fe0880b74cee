//! Ring summary types
//!
//! One `RingSummary` row per completed construction ring, produced by the
//! ring aligner from the raw sample tables.

use serde::{Deserialize, Serialize};

/// How much of the expected input data made it into a summary row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletenessFlag {
    /// PLC, attitude and monitoring association all present, no required
    /// aggregate null.
    Complete,
    /// PLC samples present but at least one required PLC aggregate is null.
    PartialPlc,
    /// Attitude samples absent or a required attitude aggregate is null.
    PartialAttitude,
    /// No settlement association found within the lag window.
    MissingMonitoring,
    /// No PLC samples at all in the ring window.
    MissingPlc,
}

impl CompletenessFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            CompletenessFlag::Complete => "complete",
            CompletenessFlag::PartialPlc => "partial_plc",
            CompletenessFlag::PartialAttitude => "partial_attitude",
            CompletenessFlag::MissingMonitoring => "missing_monitoring",
            CompletenessFlag::MissingPlc => "missing_plc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "complete" => CompletenessFlag::Complete,
            "partial_plc" => CompletenessFlag::PartialPlc,
            "partial_attitude" => CompletenessFlag::PartialAttitude,
            "missing_monitoring" => CompletenessFlag::MissingMonitoring,
            "missing_plc" => CompletenessFlag::MissingPlc,
            _ => return None,
        })
    }
}

impl std::fmt::Display for CompletenessFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a ring, derived — never stored directly.
///
/// Pending → Summarizable → Summarized-open → Summarized-final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingState {
    /// Start observed, end not yet seen.
    Pending,
    /// End observed, no summary row yet.
    Summarizable,
    /// Summary written, still inside the grace window (updatable once).
    SummarizedOpen,
    /// Terminal.
    SummarizedFinal,
}

/// mean/max/min/std over one indicator's samples within a ring window.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Aggregate {
    pub mean: Option<f64>,
    pub max: Option<f64>,
    pub min: Option<f64>,
    pub std: Option<f64>,
}

impl Aggregate {
    pub const NULL: Aggregate = Aggregate {
        mean: None,
        max: None,
        min: None,
        std: None,
    };

    pub fn is_null(&self) -> bool {
        self.mean.is_none()
    }

    /// Population statistics over `values`. Empty input yields `NULL`.
    pub fn from_values(values: &[f64]) -> Self {
        let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return Aggregate::NULL;
        }
        let n = finite.len() as f64;
        let mean = finite.iter().sum::<f64>() / n;
        let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
        let var = finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Aggregate {
            mean: Some(mean),
            max: Some(max),
            min: Some(min),
            std: Some(var.sqrt()),
        }
    }
}

/// One row per completed ring.
///
/// Append-then-maybe-update-once: a row may be updated a single time while
/// inside the grace window (late settlement data), then becomes immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingSummary {
    pub ring_number: i64,
    /// Ring window [start_ts, end_ts), epoch milliseconds.
    pub start_ts: i64,
    pub end_ts: i64,

    // PLC aggregates
    pub thrust: Aggregate,
    pub torque: Aggregate,
    pub chamber_pressure: Aggregate,
    pub advance_rate: Aggregate,
    pub grout_pressure: Aggregate,
    pub grout_volume: Aggregate,

    // Attitude aggregates
    pub mean_pitch: Option<f64>,
    pub mean_roll: Option<f64>,
    pub mean_yaw: Option<f64>,
    pub max_horizontal_deviation: Option<f64>,
    pub max_vertical_deviation: Option<f64>,

    // Time-lagged monitoring association
    pub settlement_value: Option<f64>,
    pub displacement_value: Option<f64>,
    pub groundwater_level: Option<f64>,

    // Derived indicators — null when any input is null or a divisor is zero
    pub specific_energy: Option<f64>,
    pub ground_loss_rate: Option<f64>,
    pub volume_loss_ratio: Option<f64>,

    pub geological_zone: Option<String>,
    pub completeness: CompletenessFlag,

    /// Row creation time, epoch milliseconds.
    pub created_at: i64,
    /// Last update time, epoch milliseconds.
    pub updated_at: i64,
    /// Set once the grace window has elapsed (or by operator flag); a
    /// finalized row is never updated again.
    pub finalized: bool,
    pub synced_to_cloud: bool,
}

impl RingSummary {
    /// An empty summary skeleton for a detected ring window.
    pub fn empty(ring_number: i64, start_ts: i64, end_ts: i64, now_ms: i64) -> Self {
        Self {
            ring_number,
            start_ts,
            end_ts,
            thrust: Aggregate::NULL,
            torque: Aggregate::NULL,
            chamber_pressure: Aggregate::NULL,
            advance_rate: Aggregate::NULL,
            grout_pressure: Aggregate::NULL,
            grout_volume: Aggregate::NULL,
            mean_pitch: None,
            mean_roll: None,
            mean_yaw: None,
            max_horizontal_deviation: None,
            max_vertical_deviation: None,
            settlement_value: None,
            displacement_value: None,
            groundwater_level: None,
            specific_energy: None,
            ground_loss_rate: None,
            volume_loss_ratio: None,
            geological_zone: None,
            completeness: CompletenessFlag::MissingPlc,
            created_at: now_ms,
            updated_at: now_ms,
            finalized: false,
            synced_to_cloud: false,
        }
    }

    /// Ring construction duration in minutes.
    pub fn duration_minutes(&self) -> f64 {
        (self.end_ts - self.start_ts) as f64 / 60_000.0
    }

    /// Current lifecycle state given the configured grace window.
    pub fn state(&self, now_ms: i64, grace_window_ms: i64) -> RingState {
        if self.finalized || now_ms >= self.created_at + grace_window_ms {
            RingState::SummarizedFinal
        } else {
            RingState::SummarizedOpen
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_statistics() {
        let agg = Aggregate::from_values(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(agg.mean, Some(2.5));
        assert_eq!(agg.max, Some(4.0));
        assert_eq!(agg.min, Some(1.0));
        // population std of 1,2,3,4 = sqrt(1.25)
        assert!((agg.std.unwrap() - 1.25f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_aggregate_empty_and_nonfinite() {
        assert!(Aggregate::from_values(&[]).is_null());
        assert!(Aggregate::from_values(&[f64::NAN, f64::INFINITY]).is_null());
        let agg = Aggregate::from_values(&[f64::NAN, 5.0]);
        assert_eq!(agg.mean, Some(5.0));
    }

    #[test]
    fn test_completeness_roundtrip() {
        for flag in [
            CompletenessFlag::Complete,
            CompletenessFlag::PartialPlc,
            CompletenessFlag::PartialAttitude,
            CompletenessFlag::MissingMonitoring,
            CompletenessFlag::MissingPlc,
        ] {
            assert_eq!(CompletenessFlag::parse(flag.as_str()), Some(flag));
        }
    }

    #[test]
    fn test_ring_state_transitions() {
        let mut summary = RingSummary::empty(100, 0, 300_000, 1_000_000);
        let grace = 3_600_000;
        assert_eq!(summary.state(1_000_001, grace), RingState::SummarizedOpen);
        assert_eq!(
            summary.state(1_000_000 + grace, grace),
            RingState::SummarizedFinal
        );
        summary.finalized = true;
        assert_eq!(summary.state(1_000_001, grace), RingState::SummarizedFinal);
    }
}
