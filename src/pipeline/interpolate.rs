//! Stage 2 — gap detection and linear interpolation
//!
//! Each tag owns a small rolling state: the last N good samples, the last
//! good (timestamp, value) pair, and at most one pending gap slot awaiting
//! a forward sample. Two kinds of gaps are imputed:
//!
//! - **Silent gaps**: the next good sample arrives later than the cadence
//!   hint allows. If the gap is within `gap_max_ms` a single midpoint
//!   record is synthesized; otherwise the gap is counted as dropped.
//! - **Flagged gaps**: an out-of-range record occupies a cadence slot. Its
//!   slot is imputed from the neighbouring good samples when the next one
//!   arrives within `gap_max_ms`, or filled with the held previous value
//!   once the window expires with no forward sample.
//!
//! Exactly-at-limit gaps interpolate; one millisecond over drops.

use std::collections::VecDeque;

use crate::config::QualityConfig;
use crate::types::{QualityFlag, Sample};

/// Per-tag rolling interpolation state. Owned by one source's pipeline
/// instance — no sharing, no locks.
#[derive(Debug)]
pub struct TagState {
    /// Last good (timestamp_ms, value) seen for this tag.
    last_good: Option<(i64, f64)>,
    /// Rolling history of good samples, newest at the back.
    history: VecDeque<(i64, f64)>,
    /// Timestamp of a flagged-gap slot awaiting a forward sample.
    pending_gap: Option<i64>,
    /// Gaps too old to impute.
    pub gaps_dropped: u64,
    /// Interpolated records synthesized.
    pub interpolated: u64,
}

impl TagState {
    pub fn new() -> Self {
        Self {
            last_good: None,
            history: VecDeque::new(),
            pending_gap: None,
            gaps_dropped: 0,
            interpolated: 0,
        }
    }

    /// Previous good sample, if any — consulted by the rate-of-change check
    /// before the current sample is folded in.
    pub fn last_good(&self) -> Option<(i64, f64)> {
        self.last_good
    }

    /// Feed one good sample. Returns the records to emit *before* the
    /// current sample: at most one imputed record.
    pub fn observe_good(
        &mut self,
        sample: &Sample,
        quality: &QualityConfig,
        cadence_ms: i64,
    ) -> Vec<Sample> {
        let mut out = Vec::new();
        let (t1, v1) = (sample.timestamp_ms, sample.value);

        // A pending flagged-gap slot resolves first.
        if let Some(tg) = self.pending_gap.take() {
            if let Some((t0, v0)) = self.last_good {
                let value = if t1 - tg <= quality.gap_max_ms && t1 > t0 {
                    // Forward sample arrived inside the window: linear
                    // interpolation at the gap timestamp.
                    v0 + (v1 - v0) * (tg - t0) as f64 / (t1 - t0) as f64
                } else {
                    // Window elapsed before a forward sample: hold the
                    // previous value.
                    v0
                };
                out.push(self.imputed(sample, tg, value));
            }
        } else if let Some((t0, v0)) = self.last_good {
            // Silent gap: the source skipped cadence slots entirely.
            let dt = t1 - t0;
            if dt > cadence_ms + quality.cadence_tolerance_ms {
                if dt <= quality.gap_max_ms {
                    let mid_ts = t0 + dt / 2;
                    let mid_value = (v0 + v1) / 2.0;
                    out.push(self.imputed(sample, mid_ts, mid_value));
                } else {
                    self.gaps_dropped += 1;
                    tracing::debug!(
                        tag = %sample.tag,
                        gap_ms = dt,
                        limit_ms = quality.gap_max_ms,
                        "Gap exceeds interpolation window, dropped"
                    );
                }
            }
        }

        self.last_good = Some((t1, v1));
        self.history.push_back((t1, v1));
        self.trim_history(t1, quality);
        out
    }

    /// Feed one flagged-gap record (out of range). The record itself flows
    /// through unchanged; this only registers the slot for imputation.
    pub fn observe_gap(&mut self, timestamp_ms: i64, quality: &QualityConfig) {
        match self.last_good {
            Some((t0, _)) if timestamp_ms - t0 <= quality.gap_max_ms => {
                if self.pending_gap.is_none() {
                    self.pending_gap = Some(timestamp_ms);
                }
            }
            Some(_) => {
                // Previous good sample already too old to bridge from.
                self.gaps_dropped += 1;
            }
            None => {}
        }
    }

    /// Expire the pending gap slot once `gap_max_ms` has elapsed with no
    /// forward sample, emitting the held previous value. Called from the
    /// worker's housekeeping tick so emission is deferred by at most the
    /// gap window.
    pub fn poll_expired(
        &mut self,
        now_ms: i64,
        template: &Sample,
        quality: &QualityConfig,
    ) -> Option<Sample> {
        let tg = self.pending_gap?;
        if now_ms - tg <= quality.gap_max_ms {
            return None;
        }
        self.pending_gap = None;
        let (_, v0) = self.last_good?;
        Some(self.imputed(template, tg, v0))
    }

    fn imputed(&mut self, template: &Sample, timestamp_ms: i64, value: f64) -> Sample {
        self.interpolated += 1;
        Sample {
            source_id: template.source_id.clone(),
            tag: template.tag.clone(),
            timestamp_ms,
            value,
            original_value: None,
            quality: QualityFlag::Interpolated,
            ring_number: template.ring_number,
            meta: template.meta.clone(),
        }
    }

    fn trim_history(&mut self, now_ms: i64, quality: &QualityConfig) {
        while self.history.len() > quality.history_len {
            self.history.pop_front();
        }
        while let Some(&(ts, _)) = self.history.front() {
            if now_ms - ts > quality.history_window_ms {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for TagState {
    fn default() -> Self {
        Self::new()
    }
}
