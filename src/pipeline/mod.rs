//! Quality Pipeline Module
//!
//! Fixed per-record transform, in order:
//!
//! ```text
//! STAGE 1: Threshold validation  (out-of-range → flagged, becomes a gap)
//! STAGE 2: Interpolation         (midpoint / forward-fill imputation)
//! STAGE 3: Physical reasonableness (rate + cross-tag rules, value kept)
//! STAGE 4: Calibration           (linear, raw value preserved)
//! STAGE 5: Quality metrics       (advisory counters, never affects data)
//! ```
//!
//! One [`SourcePipeline`] instance per data source, invoked on that source's
//! worker task. All rolling state is owned by the instance — no shared
//! mutable state across sources, no locks in the hot path. The config is
//! read through an atomic snapshot acquired once per record.

mod calibration;
mod interpolate;
mod metrics;
mod reasonableness;
mod threshold;

pub use calibration::{apply as apply_calibration, apply_to_sample};
pub use interpolate::TagState;
pub use metrics::{MetricsSnapshot, QualityMetrics, Stage};
pub use reasonableness::{exceeds_max_rate, violated_cross_rule};
pub use threshold::{validate as validate_threshold, ThresholdVerdict};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::ConfigHandle;
use crate::types::{QualityFlag, Sample};

/// Per-source quality pipeline.
///
/// Deterministic: the same record sequence against the same config snapshot
/// always yields the same output records and flags.
pub struct SourcePipeline {
    config: ConfigHandle,
    metrics: Arc<QualityMetrics>,
    /// Rolling interpolation state per tag.
    tags: HashMap<String, TagState>,
    /// Latest accepted value per tag, for cross-tag rules.
    latest: HashMap<String, f64>,
    /// Last seen sample per tag — template for expiry-driven imputation.
    templates: HashMap<String, Sample>,
    /// Cadence hints per tag, milliseconds.
    cadence: HashMap<String, i64>,
    default_cadence_ms: i64,
}

impl SourcePipeline {
    pub fn new(
        config: ConfigHandle,
        metrics: Arc<QualityMetrics>,
        cadence: HashMap<String, i64>,
        default_cadence_ms: i64,
    ) -> Self {
        Self {
            config,
            metrics,
            tags: HashMap::new(),
            latest: HashMap::new(),
            templates: HashMap::new(),
            cadence,
            default_cadence_ms,
        }
    }

    /// Run one raw sample through all stages.
    ///
    /// Returns the records to persist, oldest first: zero or one imputed
    /// record followed by the (possibly flagged and calibrated) input
    /// record. Records flagged Missing are never produced here.
    pub fn process(&mut self, mut sample: Sample) -> Vec<Sample> {
        let started = Instant::now();
        let cfg = self.config.load();
        let cadence_ms = self
            .cadence
            .get(&sample.tag)
            .copied()
            .unwrap_or(self.default_cadence_ms);

        let mut out = Vec::with_capacity(2);
        let mut stage = Stage::None;

        // STAGE 1: threshold validation
        match threshold::validate(sample.value, cfg.thresholds.get(&sample.tag)) {
            ThresholdVerdict::OutOfRange => {
                sample.quality = QualityFlag::OutOfRange;
                stage = Stage::Threshold;
            }
            ThresholdVerdict::WarnLow | ThresholdVerdict::WarnHigh => {
                self.metrics.record_warn(&sample.tag, sample.value);
            }
            ThresholdVerdict::InRange => {}
        }

        let state = self.tags.entry(sample.tag.clone()).or_default();
        let prev_good = state.last_good();

        if sample.quality == QualityFlag::OutOfRange {
            // The flagged record flows through for accounting; its slot is
            // registered as a gap to be imputed.
            state.observe_gap(sample.timestamp_ms, &cfg.quality);
        } else {
            // STAGE 2: interpolation — may synthesize one imputed record
            // covering the gap before this sample.
            let before = state.gaps_dropped;
            for mut imputed in state.observe_good(&sample, &cfg.quality, cadence_ms) {
                let imputed_cal = cfg.calibration.get(&imputed.tag);
                calibration::apply_to_sample(&mut imputed, imputed_cal);
                self.metrics.record(
                    &imputed.tag,
                    QualityFlag::Interpolated,
                    Stage::Interpolation,
                    0,
                );
                out.push(imputed);
            }
            for _ in before..state.gaps_dropped {
                self.metrics.record_gap_dropped();
            }

            // STAGE 3: physical reasonableness
            if let Some(&max_rate) = cfg.reasonableness.max_rate.get(&sample.tag) {
                if let Some(prev) = prev_good {
                    if reasonableness::exceeds_max_rate(
                        prev,
                        (sample.timestamp_ms, sample.value),
                        max_rate,
                    ) {
                        sample.quality = QualityFlag::PhysicallyImplausible;
                        stage = Stage::Reasonableness;
                    }
                }
            }
            self.latest.insert(sample.tag.clone(), sample.value);
            if sample.quality == QualityFlag::Good {
                if let Some(rule) =
                    reasonableness::violated_cross_rule(&cfg.reasonableness, &sample.tag, &self.latest)
                {
                    tracing::debug!(
                        tag = %sample.tag,
                        rule = %rule.name,
                        "Cross-tag reasonableness rule violated"
                    );
                    sample.quality = QualityFlag::PhysicallyImplausible;
                    stage = Stage::Reasonableness;
                }
            }
        }

        // STAGE 4: calibration
        let flag_before = sample.quality;
        let sample_cal = cfg.calibration.get(&sample.tag);
        calibration::apply_to_sample(&mut sample, sample_cal);
        if sample.quality == QualityFlag::CalibratedFromRaw && flag_before == QualityFlag::Good {
            stage = Stage::Calibration;
        }

        // STAGE 5: metrics
        let latency_us = started.elapsed().as_micros() as u64;
        self.metrics
            .record(&sample.tag, sample.quality, stage, latency_us);

        self.templates.insert(sample.tag.clone(), sample.clone());
        out.push(sample);
        out
    }

    /// Housekeeping tick: emit held-value imputations for gap slots whose
    /// look-ahead window expired with no forward sample.
    pub fn poll_expired(&mut self, now_ms: i64) -> Vec<Sample> {
        let cfg = self.config.load();
        let mut out = Vec::new();
        for (tag, state) in &mut self.tags {
            let Some(template) = self.templates.get(tag) else {
                continue;
            };
            if let Some(mut held) = state.poll_expired(now_ms, template, &cfg.quality) {
                calibration::apply_to_sample(&mut held, cfg.calibration.get(tag));
                self.metrics
                    .record(tag, QualityFlag::Interpolated, Stage::Interpolation, 0);
                out.push(held);
            }
        }
        out
    }

    pub fn metrics(&self) -> &Arc<QualityMetrics> {
        &self.metrics
    }
}
