//! Stage 5 — quality metrics sink
//!
//! Advisory per-record accounting: which flag, which stage assigned it, and
//! how long the record spent in the pipeline. Counters are lock-free atomics
//! merged on read; nothing here may affect persistence.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::types::QualityFlag;

/// Pipeline stage that assigned a record's final flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Threshold,
    Interpolation,
    Reasonableness,
    Calibration,
    /// No stage changed the record.
    None,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Threshold => "threshold",
            Stage::Interpolation => "interpolation",
            Stage::Reasonableness => "reasonableness",
            Stage::Calibration => "calibration",
            Stage::None => "none",
        }
    }
}

/// Shared counters for one source's pipeline instance.
#[derive(Debug, Default)]
pub struct QualityMetrics {
    good: AtomicU64,
    interpolated: AtomicU64,
    out_of_range: AtomicU64,
    implausible: AtomicU64,
    calibrated: AtomicU64,
    warn_crossings: AtomicU64,
    gaps_dropped: AtomicU64,
    latency_us_total: AtomicU64,
    latency_us_max: AtomicU64,
    records: AtomicU64,
}

impl QualityMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished record. Emits a debug event; counters feed the
    /// merged health/statistics surface.
    pub fn record(&self, tag: &str, flag: QualityFlag, stage: Stage, latency_us: u64) {
        match flag {
            QualityFlag::Good => &self.good,
            QualityFlag::Interpolated => &self.interpolated,
            QualityFlag::OutOfRange => &self.out_of_range,
            QualityFlag::PhysicallyImplausible => &self.implausible,
            QualityFlag::CalibratedFromRaw => &self.calibrated,
            QualityFlag::Missing => &self.gaps_dropped,
        }
        .fetch_add(1, Ordering::Relaxed);
        self.records.fetch_add(1, Ordering::Relaxed);
        self.latency_us_total.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_us_max.fetch_max(latency_us, Ordering::Relaxed);

        tracing::debug!(
            tag = tag,
            flag = %flag,
            stage = stage.as_str(),
            latency_us = latency_us,
            "Quality verdict"
        );
    }

    /// An advisory warn-band crossing (value unchanged).
    pub fn record_warn(&self, tag: &str, value: f64) {
        self.warn_crossings.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(tag = tag, value = value, "Warn threshold crossed");
    }

    pub fn record_gap_dropped(&self) {
        self.gaps_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let records = self.records.load(Ordering::Relaxed);
        let total_us = self.latency_us_total.load(Ordering::Relaxed);
        MetricsSnapshot {
            good: self.good.load(Ordering::Relaxed),
            interpolated: self.interpolated.load(Ordering::Relaxed),
            out_of_range: self.out_of_range.load(Ordering::Relaxed),
            implausible: self.implausible.load(Ordering::Relaxed),
            calibrated: self.calibrated.load(Ordering::Relaxed),
            warn_crossings: self.warn_crossings.load(Ordering::Relaxed),
            gaps_dropped: self.gaps_dropped.load(Ordering::Relaxed),
            records,
            mean_latency_us: if records > 0 { total_us / records } else { 0 },
            max_latency_us: self.latency_us_max.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a pipeline's counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricsSnapshot {
    pub good: u64,
    pub interpolated: u64,
    pub out_of_range: u64,
    pub implausible: u64,
    pub calibrated: u64,
    pub warn_crossings: u64,
    pub gaps_dropped: u64,
    pub records: u64,
    pub mean_latency_us: u64,
    pub max_latency_us: u64,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} records ({} good, {} calibrated, {} interpolated, {} out-of-range, {} implausible), mean {}us",
            self.records,
            self.good,
            self.calibrated,
            self.interpolated,
            self.out_of_range,
            self.implausible,
            self.mean_latency_us
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = QualityMetrics::new();
        metrics.record("x", QualityFlag::Good, Stage::None, 10);
        metrics.record("x", QualityFlag::OutOfRange, Stage::Threshold, 30);
        metrics.record("x", QualityFlag::CalibratedFromRaw, Stage::Calibration, 20);
        metrics.record_warn("x", 1.0);

        let snap = metrics.snapshot();
        assert_eq!(snap.records, 3);
        assert_eq!(snap.good, 1);
        assert_eq!(snap.out_of_range, 1);
        assert_eq!(snap.calibrated, 1);
        assert_eq!(snap.warn_crossings, 1);
        assert_eq!(snap.mean_latency_us, 20);
        assert_eq!(snap.max_latency_us, 30);
    }
}
