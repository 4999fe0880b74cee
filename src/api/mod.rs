//! Core API surface consumed by the out-of-scope layers
//!
//! The REST façade, dashboard fan-out and cloud sync all sit on these four
//! operations:
//!
//! - [`EdgeApi::list_rings`] — paginated ring summaries with filters
//! - [`EdgeApi::get_ring`] — one summary, optionally with raw-row counts
//! - [`EdgeApi::submit_manual_logs`] — operator log entry, screened through
//!   threshold validation, reasonableness and calibration, inserted
//!   atomically with per-row acceptance
//! - [`EdgeApi::health`] — merged component status

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::aligner::RingAligner;
use crate::buffer::BufferStats;
use crate::collector::SourceHealthState;
use crate::config::ConfigHandle;
use crate::pipeline::{self, ThresholdVerdict};
use crate::storage::{EdgeStore, RingFilter, RingPage, StoreError};
use crate::types::{
    HealthLevel, HealthReport, QualityFlag, RingSummary, Sample, TableKind,
};

/// Source id recorded on operator-entered rows.
const MANUAL_SOURCE_ID: &str = "manual";

/// One summary with optional underlying raw-sample counts.
#[derive(Debug, Clone, Serialize)]
pub struct RingDetail {
    pub summary: RingSummary,
    pub raw_counts: Option<RawCounts>,
}

/// Raw rows inside the ring window, per table.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RawCounts {
    pub plc: u64,
    pub attitude: u64,
    pub monitoring: u64,
}

/// One operator-entered log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualLog {
    pub tag: String,
    pub timestamp_ms: i64,
    pub value: f64,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
}

/// A manual submission across the three sample tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManualBatch {
    #[serde(default)]
    pub plc_logs: Vec<ManualLog>,
    #[serde(default)]
    pub attitude_logs: Vec<ManualLog>,
    #[serde(default)]
    pub monitoring_logs: Vec<ManualLog>,
    pub operator_id: String,
}

/// Why a row was not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedLog {
    pub table: TableKind,
    /// Index within that table's submitted list.
    pub index: usize,
    pub tag: String,
    pub reason: String,
}

/// Per-row outcome of a manual submission.
#[derive(Debug, Clone, Serialize)]
pub struct ManualSubmitReport {
    pub accepted: usize,
    pub rejected: Vec<RejectedLog>,
}

/// Handle bundling everything the exposed operations need.
#[derive(Clone)]
pub struct EdgeApi {
    store: Arc<EdgeStore>,
    config: ConfigHandle,
    collector_health: Vec<Arc<SourceHealthState>>,
    buffer_stats: Vec<(TableKind, Arc<BufferStats>)>,
    aligner: Arc<RingAligner>,
}

impl EdgeApi {
    pub fn new(
        store: Arc<EdgeStore>,
        config: ConfigHandle,
        collector_health: Vec<Arc<SourceHealthState>>,
        buffer_stats: Vec<(TableKind, Arc<BufferStats>)>,
        aligner: Arc<RingAligner>,
    ) -> Self {
        Self {
            store,
            config,
            collector_health,
            buffer_stats,
            aligner,
        }
    }

    /// Paginated ring summaries.
    pub fn list_rings(&self, filter: &RingFilter) -> Result<RingPage, StoreError> {
        self.store.list_summaries(filter)
    }

    /// One ring summary, optionally annotated with raw-row counts.
    pub fn get_ring(
        &self,
        ring_number: i64,
        include_raw_counts: bool,
    ) -> Result<Option<RingDetail>, StoreError> {
        let Some(summary) = self.store.get_summary(ring_number)? else {
            return Ok(None);
        };
        let raw_counts = if include_raw_counts {
            Some(RawCounts {
                plc: self
                    .store
                    .count_range(TableKind::Plc, summary.start_ts, summary.end_ts)?,
                attitude: self
                    .store
                    .count_range(TableKind::Attitude, summary.start_ts, summary.end_ts)?,
                monitoring: self
                    .store
                    .count_range(TableKind::Monitoring, summary.start_ts, summary.end_ts)?,
            })
        } else {
            None
        };
        Ok(Some(RingDetail { summary, raw_counts }))
    }

    /// Screen and atomically insert operator log entries.
    ///
    /// Manual rows bypass source decoding and interpolation but still face
    /// threshold validation, cross-tag reasonableness and calibration.
    /// Rows outside their threshold envelope are rejected outright — an
    /// operator typo should bounce, not be stored flagged. Rows that only
    /// fail a cross-tag rule persist flagged physically_implausible, the
    /// same verdict live data gets.
    pub fn submit_manual_logs(&self, batch: &ManualBatch) -> Result<ManualSubmitReport, StoreError> {
        let cfg = self.config.load();
        let mut rejected = Vec::new();
        let mut to_insert: Vec<(TableKind, Vec<Sample>)> = Vec::new();

        // Latest values across the whole submission, for cross-tag rules.
        let mut latest: HashMap<String, f64> = HashMap::new();
        for log in batch
            .plc_logs
            .iter()
            .chain(&batch.attitude_logs)
            .chain(&batch.monitoring_logs)
        {
            latest.insert(log.tag.clone(), log.value);
        }

        for (table, logs) in [
            (TableKind::Plc, &batch.plc_logs),
            (TableKind::Attitude, &batch.attitude_logs),
            (TableKind::Monitoring, &batch.monitoring_logs),
        ] {
            let mut accepted_rows = Vec::new();
            for (index, log) in logs.iter().enumerate() {
                match screen_manual_log(&cfg, table, log, &latest) {
                    Ok(sample) => accepted_rows.push(sample),
                    Err(reason) => rejected.push(RejectedLog {
                        table,
                        index,
                        tag: log.tag.clone(),
                        reason,
                    }),
                }
            }
            if !accepted_rows.is_empty() {
                to_insert.push((table, accepted_rows));
            }
        }

        let accepted = self.store.insert_all(&to_insert)?;
        tracing::info!(
            operator = %batch.operator_id,
            accepted,
            rejected = rejected.len(),
            "Manual logs submitted"
        );
        Ok(ManualSubmitReport { accepted, rejected })
    }

    /// Merged component health.
    pub fn health(&self) -> HealthReport {
        let now = crate::types::now_ms();
        let mut report = HealthReport {
            level: HealthLevel::Ok,
            collectors: self
                .collector_health
                .iter()
                .map(|h| h.snapshot(now))
                .collect(),
            buffers: self
                .buffer_stats
                .iter()
                .map(|(table, stats)| stats.snapshot(*table))
                .collect(),
            aligner: self.aligner.health(),
            db_writable: self.store.writable(),
        };
        report.resolve_level();
        report
    }
}

/// Threshold + reasonableness + calibration for one manual row.
fn screen_manual_log(
    cfg: &crate::config::EdgeConfig,
    table: TableKind,
    log: &ManualLog,
    latest: &HashMap<String, f64>,
) -> Result<Sample, String> {
    if log.tag.trim().is_empty() {
        return Err("empty tag".to_string());
    }
    if log.timestamp_ms <= 0 {
        return Err(format!("bad timestamp: {}", log.timestamp_ms));
    }

    match pipeline::validate_threshold(log.value, cfg.thresholds.get(&log.tag)) {
        ThresholdVerdict::OutOfRange => {
            return Err(format!("value {} outside threshold envelope", log.value));
        }
        ThresholdVerdict::WarnLow | ThresholdVerdict::WarnHigh | ThresholdVerdict::InRange => {}
    }

    let mut sample = Sample::raw(MANUAL_SOURCE_ID, &log.tag, log.timestamp_ms, log.value);
    if table == TableKind::Monitoring {
        sample.meta.location = log.location.clone();
        sample.meta.unit = log.unit.clone();
    }

    if pipeline::violated_cross_rule(&cfg.reasonableness, &log.tag, latest).is_some() {
        sample.quality = QualityFlag::PhysicallyImplausible;
    }
    pipeline::apply_to_sample(&mut sample, cfg.calibration.get(&log.tag));
    Ok(sample)
}
