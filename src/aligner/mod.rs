//! Ring Aligner — completed rings of raw samples become summary rows
//!
//! A periodic job (default every 300 s) that bridges the raw sample tables
//! and the summary table. Each tick:
//!
//! 1. Finds rings n in (summarized_max, plc_max] whose end boundary is
//!    known (ring n+1 has been observed) and summarizes each: per-indicator
//!    aggregates, attitude means, settlement association, derived
//!    indicators, completeness flag.
//! 2. Re-attempts settlement association for still-open summaries; rings
//!    older than `max_ring_age` are finalized as-is.
//! 3. Finalizes rows whose grace window elapsed and runs the retention
//!    sweep.
//!
//! An aggregation error for one ring logs and moves on — the next tick
//! retries it. Nothing here raises past the job's own loop.

mod aggregate;
mod boundary;
mod derived;
mod settlement;

pub use aggregate::{aggregate_attitude, aggregate_plc, AttitudeAggregates, PlcAggregates, RingWindow};
pub use boundary::{RingObservation, RingTracker};
pub use derived::{ground_loss_rate, specific_energy, volume_loss_ratio};
pub use settlement::{associate as associate_settlement, SettlementReading};

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{ConfigHandle, EdgeConfig};
use crate::storage::{EdgeStore, StoreError};
use crate::types::{AlignerHealth, CompletenessFlag, RingSummary};

/// Ring durations outside this band get a warning — data is still
/// summarized, the log is for the operator.
const MIN_PLAUSIBLE_RING_MINUTES: f64 = 10.0;
const MAX_PLAUSIBLE_RING_MINUTES: f64 = 120.0;

/// What one tick accomplished.
#[derive(Debug, Default, Clone)]
pub struct TickReport {
    pub summarized: Vec<i64>,
    pub updated: Vec<i64>,
    pub finalized: u64,
    pub retention_deleted: u64,
}

/// The periodic alignment job.
pub struct RingAligner {
    store: Arc<EdgeStore>,
    config: ConfigHandle,
    last_tick_ms: AtomicI64,
    rings_summarized: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl RingAligner {
    pub fn new(store: Arc<EdgeStore>, config: ConfigHandle) -> Self {
        Self {
            store,
            config,
            last_tick_ms: AtomicI64::new(0),
            rings_summarized: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn health(&self) -> AlignerHealth {
        let last = self.last_tick_ms.load(Ordering::Relaxed);
        AlignerHealth {
            last_tick_ts: (last > 0).then_some(last),
            rings_summarized: self.rings_summarized.load(Ordering::Relaxed),
            last_error: self.last_error.lock().expect("aligner mutex").clone(),
        }
    }

    /// Run on a timer until cancelled. Finishes the tick in progress before
    /// exiting.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let tick_interval =
            Duration::from_secs(self.config.load().aligner.tick_interval_s.max(1));
        let mut timer = tokio::time::interval(tick_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(interval_s = tick_interval.as_secs(), "Ring aligner started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    let report = self.tick(crate::types::now_ms());
                    if !report.summarized.is_empty() || !report.updated.is_empty() {
                        tracing::info!(
                            summarized = report.summarized.len(),
                            updated = report.updated.len(),
                            finalized = report.finalized,
                            "Aligner tick complete"
                        );
                    }
                }
            }
        }
        tracing::info!("Ring aligner stopped");
    }

    /// One deterministic pass. Public so tests and operators can drive it
    /// without the timer.
    pub fn tick(&self, now_ms: i64) -> TickReport {
        self.last_tick_ms.store(now_ms, Ordering::Relaxed);
        let cfg = self.config.load();
        let mut report = TickReport::default();

        if let Err(e) = self.summarize_new_rings(&cfg, now_ms, &mut report) {
            self.note_error(&e);
        }
        if let Err(e) = self.revisit_open_rings(&cfg, now_ms, &mut report) {
            self.note_error(&e);
        }
        match self
            .store
            .finalize_expired(now_ms, cfg.aligner.grace_window_s * 1_000)
        {
            Ok(n) => report.finalized += n,
            Err(e) => self.note_error(&e),
        }
        match self.store.retention_sweep(&cfg.store.retention, now_ms) {
            Ok(n) => report.retention_deleted = n,
            Err(e) => self.note_error(&e),
        }
        report
    }

    /// Detection and aggregation of newly completed rings.
    fn summarize_new_rings(
        &self,
        cfg: &EdgeConfig,
        now_ms: i64,
        report: &mut TickReport,
    ) -> Result<(), StoreError> {
        let Some(plc_max) = self.store.max_ring_number()? else {
            return Ok(());
        };
        let first_candidate = match self.store.max_summarized_ring()? {
            Some(max) => max + 1,
            None => match self.store.min_ring_number()? {
                Some(min) => min,
                None => return Ok(()),
            },
        };

        let ring_tag = &cfg.aligner.tags.ring_number;
        for ring in first_candidate..=plc_max {
            let Some(start_ts) = self.store.ring_start_ts(ring_tag, ring)? else {
                tracing::warn!(ring, "Ring start never observed — density gap, skipping");
                continue;
            };
            // A ring is complete only once its successor's start is known.
            let Some(end_ts) = self.store.ring_start_ts(ring_tag, ring + 1)? else {
                break;
            };
            if self.store.get_summary(ring)?.is_some() {
                continue;
            }

            let window = RingWindow {
                ring,
                start_ts,
                end_ts,
            };
            match self.summarize_ring(cfg, &window, now_ms) {
                Ok(summary) => {
                    self.store.insert_summary(&summary)?;
                    self.rings_summarized.fetch_add(1, Ordering::Relaxed);
                    report.summarized.push(ring);
                    tracing::info!(
                        ring,
                        completeness = %summary.completeness,
                        duration_min = format!("{:.1}", window.duration_minutes()),
                        "Ring summarized"
                    );
                }
                Err(e) => {
                    // Log and move on; the next tick retries this ring.
                    tracing::error!(ring, error = %e, "Ring aggregation failed");
                    self.note_error(&e);
                }
            }
        }
        Ok(())
    }

    /// Aggregate one ring window into a summary row.
    fn summarize_ring(
        &self,
        cfg: &EdgeConfig,
        window: &RingWindow,
        now_ms: i64,
    ) -> Result<RingSummary, StoreError> {
        let duration_min = window.duration_minutes();
        if !(MIN_PLAUSIBLE_RING_MINUTES..=MAX_PLAUSIBLE_RING_MINUTES).contains(&duration_min) {
            tracing::warn!(
                ring = window.ring,
                duration_min = format!("{duration_min:.1}"),
                "Ring duration outside the plausible band"
            );
        }

        let tags = &cfg.aligner.tags;
        let geometry = &cfg.aligner.geometry;
        let plc = aggregate::aggregate_plc(&self.store, window, tags)?;
        let attitude = aggregate::aggregate_attitude(&self.store, window, tags)?;
        let reading = settlement::associate(
            &self.store,
            window.start_ts,
            cfg.aligner.settlement_lag_window_s * 1_000,
            tags,
        )?;

        let mut summary = RingSummary::empty(window.ring, window.start_ts, window.end_ts, now_ms);
        summary.thrust = plc.thrust;
        summary.torque = plc.torque;
        summary.chamber_pressure = plc.chamber_pressure;
        summary.advance_rate = plc.advance_rate;
        summary.grout_pressure = plc.grout_pressure;
        summary.grout_volume = plc.grout_volume;
        summary.mean_pitch = attitude.mean_pitch;
        summary.mean_roll = attitude.mean_roll;
        summary.mean_yaw = attitude.mean_yaw;
        summary.max_horizontal_deviation = attitude.max_horizontal_deviation;
        summary.max_vertical_deviation = attitude.max_vertical_deviation;
        summary.settlement_value = reading.settlement;
        summary.displacement_value = reading.displacement;
        summary.groundwater_level = reading.groundwater;

        summary.specific_energy = derived::specific_energy(
            summary.torque.mean,
            plc.cutterhead_speed.mean,
            duration_min,
            geometry,
        );
        summary.ground_loss_rate = derived::ground_loss_rate(summary.grout_volume.mean, geometry);
        summary.volume_loss_ratio =
            derived::volume_loss_ratio(summary.ground_loss_rate, geometry);

        summary.geological_zone = cfg.zone_for_ring(window.ring).map(str::to_string);
        summary.completeness = completeness(&plc, &attitude, &reading);
        Ok(summary)
    }

    /// Late-settlement re-attempt and max-age finalization for open rows.
    fn revisit_open_rings(
        &self,
        cfg: &EdgeConfig,
        now_ms: i64,
        report: &mut TickReport,
    ) -> Result<(), StoreError> {
        let max_age_ms = cfg.aligner.max_ring_age_s * 1_000;
        for mut summary in self.store.open_summaries()? {
            if now_ms - summary.end_ts > max_age_ms {
                if summary.completeness != CompletenessFlag::Complete {
                    tracing::warn!(
                        ring = summary.ring_number,
                        completeness = %summary.completeness,
                        "Ring exceeded max age, finalizing as-is"
                    );
                }
                self.store.mark_finalized(summary.ring_number)?;
                report.finalized += 1;
                continue;
            }
            if summary.settlement_value.is_some() {
                continue;
            }
            let reading = settlement::associate(
                &self.store,
                summary.start_ts,
                cfg.aligner.settlement_lag_window_s * 1_000,
                &cfg.aligner.tags,
            )?;
            if !reading.found() {
                continue;
            }
            summary.settlement_value = reading.settlement;
            // Displacement is preserved when already set, else taken from
            // the same association pass.
            summary.displacement_value = summary.displacement_value.or(reading.displacement);
            summary.groundwater_level = summary.groundwater_level.or(reading.groundwater);
            if summary.completeness == CompletenessFlag::MissingMonitoring {
                summary.completeness = CompletenessFlag::Complete;
            }
            summary.updated_at = now_ms;
            if self.store.update_summary(&summary)? {
                report.updated.push(summary.ring_number);
                tracing::info!(
                    ring = summary.ring_number,
                    settlement = reading.settlement,
                    "Late settlement associated"
                );
            }
        }
        Ok(())
    }

    fn note_error(&self, e: &StoreError) {
        *self.last_error.lock().expect("aligner mutex") = Some(e.to_string());
    }
}

/// I3: complete iff PLC present, attitude present, monitoring associated,
/// and no required aggregate is null.
fn completeness(
    plc: &PlcAggregates,
    attitude: &AttitudeAggregates,
    reading: &SettlementReading,
) -> CompletenessFlag {
    if plc.sample_count == 0 {
        return CompletenessFlag::MissingPlc;
    }
    let required = [
        plc.thrust.mean,
        plc.torque.mean,
        plc.chamber_pressure.mean,
        plc.advance_rate.mean,
    ];
    if required.iter().any(Option::is_none) {
        return CompletenessFlag::PartialPlc;
    }
    if attitude.sample_count == 0
        || attitude.mean_pitch.is_none()
        || attitude.mean_roll.is_none()
        || attitude.mean_yaw.is_none()
    {
        return CompletenessFlag::PartialAttitude;
    }
    if !reading.found() {
        return CompletenessFlag::MissingMonitoring;
    }
    CompletenessFlag::Complete
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{QualityFlag, Sample, TableKind};

    fn temp_store() -> (tempfile::TempDir, Arc<EdgeStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(EdgeStore::open(dir.path().join("edge.db")).unwrap());
        (dir, store)
    }

    fn plc(tag: &str, ts: i64, value: f64, ring: i64) -> Sample {
        let mut s = Sample::raw("plc_main", tag, ts, value);
        s.ring_number = Some(ring);
        s
    }

    fn attitude(tag: &str, ts: i64, value: f64, ring: i64) -> Sample {
        let mut s = Sample::raw("guidance", tag, ts, value);
        s.ring_number = Some(ring);
        s
    }

    /// Ring 100 for t in [0, 300 s), ring 101 from t=300 s: thrust ramps
    /// 10000..=10599 one per second.
    fn seed_happy_path(store: &EdgeStore) {
        let mut rows = Vec::new();
        for i in 0..600i64 {
            let ring = if i < 300 { 100 } else { 101 };
            let ts = i * 1_000;
            rows.push(plc("ring_number", ts, ring as f64, ring));
            rows.push(plc("thrust_total", ts, 10_000.0 + i as f64, ring));
            rows.push(plc("cutterhead_torque", ts, 3_000.0, ring));
            rows.push(plc("chamber_pressure", ts, 2.1, ring));
            rows.push(plc("advance_rate", ts, 12.0, ring));
            rows.push(plc("cutterhead_speed", ts, 1.2, ring));
        }
        store.insert_samples(TableKind::Plc, &rows).unwrap();

        let mut att = Vec::new();
        for i in 0..600i64 {
            let ring = if i < 300 { 100 } else { 101 };
            let ts = i * 1_000;
            att.push(attitude("pitch", ts, 0.5, ring));
            att.push(attitude("roll", ts, -0.2, ring));
            att.push(attitude("yaw", ts, 0.1, ring));
            att.push(attitude("horizontal_deviation", ts, -20.0, ring));
            att.push(attitude("vertical_deviation", ts, 8.0, ring));
        }
        store.insert_samples(TableKind::Attitude, &att).unwrap();
    }

    fn aligner(store: Arc<EdgeStore>) -> RingAligner {
        RingAligner::new(store, ConfigHandle::new(EdgeConfig::default()))
    }

    #[test]
    fn test_happy_path_single_ring() {
        let (_dir, store) = temp_store();
        seed_happy_path(&store);
        let aligner = aligner(store.clone());

        let report = aligner.tick(700_000);
        // Ring 101 has no successor, so only ring 100 is summarizable.
        assert_eq!(report.summarized, vec![100]);

        let s = store.get_summary(100).unwrap().unwrap();
        assert_eq!(s.start_ts, 0);
        assert_eq!(s.end_ts, 300_000);
        assert_eq!(s.thrust.mean, Some(10_149.5));
        assert_eq!(s.thrust.max, Some(10_299.0));
        assert_eq!(s.thrust.min, Some(10_000.0));
        // No monitoring data: settlement missing.
        assert_eq!(s.completeness, CompletenessFlag::MissingMonitoring);
        assert!(s.specific_energy.is_some());
    }

    #[test]
    fn test_window_membership_is_half_open() {
        // The transitioning sample (t=300 s, ring 101) belongs to the new
        // ring: ring 100 aggregates stop at 10299.
        let (_dir, store) = temp_store();
        seed_happy_path(&store);
        aligner(store.clone()).tick(700_000);
        let s = store.get_summary(100).unwrap().unwrap();
        assert_eq!(s.thrust.max, Some(10_299.0));
    }

    #[test]
    fn test_idempotent_reruns() {
        let (_dir, store) = temp_store();
        seed_happy_path(&store);
        let aligner = aligner(store.clone());

        aligner.tick(700_000);
        let first = store.get_summary(100).unwrap().unwrap();
        // Second tick over the same data must not touch the row.
        let report = aligner.tick(800_000);
        assert!(report.summarized.is_empty());
        let second = store.get_summary(100).unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_delayed_settlement_updates_row_once() {
        let (_dir, store) = temp_store();
        seed_happy_path(&store);
        let aligner = aligner(store.clone());

        aligner.tick(700_000);
        let before = store.get_summary(100).unwrap().unwrap();
        assert_eq!(before.completeness, CompletenessFlag::MissingMonitoring);
        assert_eq!(before.settlement_value, None);

        // Settlement arrives late, inside the lag window from ring start.
        store
            .insert_samples(
                TableKind::Monitoring,
                &[
                    Sample::raw("survey_api", "settlement_value", 60_000, -2.7),
                    Sample::raw("survey_api", "displacement_value", 60_000, 1.1),
                ],
            )
            .unwrap();

        let report = aligner.tick(900_000);
        assert_eq!(report.updated, vec![100]);
        let after = store.get_summary(100).unwrap().unwrap();
        assert_eq!(after.settlement_value, Some(-2.7));
        assert_eq!(after.displacement_value, Some(1.1));
        assert_eq!(after.completeness, CompletenessFlag::Complete);
        assert_eq!(after.created_at, before.created_at);
    }

    #[test]
    fn test_max_age_finalizes_incomplete_ring() {
        let (_dir, store) = temp_store();
        seed_happy_path(&store);
        let aligner = aligner(store.clone());
        aligner.tick(700_000);

        // Far past max_ring_age (24 h after the ring end).
        let later = 300_000 + 86_400_000 + 1_000;
        aligner.tick(later);
        let s = store.get_summary(100).unwrap().unwrap();
        assert!(s.finalized);
        // A finalized row no longer accepts settlement updates.
        store
            .insert_samples(
                TableKind::Monitoring,
                &[Sample::raw("survey_api", "settlement_value", 60_000, -2.7)],
            )
            .unwrap();
        aligner.tick(later + 1_000);
        let s = store.get_summary(100).unwrap().unwrap();
        assert_eq!(s.settlement_value, None);
    }

    #[test]
    fn test_flagged_samples_excluded_from_aggregates() {
        let (_dir, store) = temp_store();
        seed_happy_path(&store);
        // An out-of-range spike inside ring 100 must not move the mean.
        let mut spike = plc("thrust_total", 150_500, 999_999.0, 100);
        spike.quality = QualityFlag::OutOfRange;
        store.insert_samples(TableKind::Plc, &[spike]).unwrap();

        aligner(store.clone()).tick(700_000);
        let s = store.get_summary(100).unwrap().unwrap();
        assert_eq!(s.thrust.mean, Some(10_149.5));
        assert_eq!(s.thrust.max, Some(10_299.0));
    }

    #[test]
    fn test_completeness_partial_attitude() {
        let (_dir, store) = temp_store();
        // PLC only, no attitude rows at all.
        let mut rows = Vec::new();
        for i in 0..600i64 {
            let ring = if i < 300 { 100 } else { 101 };
            let ts = i * 1_000;
            rows.push(plc("ring_number", ts, ring as f64, ring));
            rows.push(plc("thrust_total", ts, 10_000.0, ring));
            rows.push(plc("cutterhead_torque", ts, 3_000.0, ring));
            rows.push(plc("chamber_pressure", ts, 2.1, ring));
            rows.push(plc("advance_rate", ts, 12.0, ring));
        }
        store.insert_samples(TableKind::Plc, &rows).unwrap();

        aligner(store.clone()).tick(700_000);
        let s = store.get_summary(100).unwrap().unwrap();
        assert_eq!(s.completeness, CompletenessFlag::PartialAttitude);
    }

    #[test]
    fn test_completeness_partial_plc() {
        let (_dir, store) = temp_store();
        // PLC rows exist but a required indicator (torque) is absent.
        let mut rows = Vec::new();
        for i in 0..600i64 {
            let ring = if i < 300 { 100 } else { 101 };
            let ts = i * 1_000;
            rows.push(plc("ring_number", ts, ring as f64, ring));
            rows.push(plc("thrust_total", ts, 10_000.0, ring));
        }
        store.insert_samples(TableKind::Plc, &rows).unwrap();

        aligner(store.clone()).tick(700_000);
        let s = store.get_summary(100).unwrap().unwrap();
        assert_eq!(s.completeness, CompletenessFlag::PartialPlc);
    }

    #[test]
    fn test_zone_label_applied() {
        let (_dir, store) = temp_store();
        seed_happy_path(&store);
        let mut cfg = EdgeConfig::default();
        cfg.aligner.zones.push(crate::config::GeoZone {
            from_ring: 1,
            to_ring: 200,
            label: "soft clay".to_string(),
        });
        let aligner = RingAligner::new(store.clone(), ConfigHandle::new(cfg));
        aligner.tick(700_000);
        let s = store.get_summary(100).unwrap().unwrap();
        assert_eq!(s.geological_zone.as_deref(), Some("soft clay"));
    }
}
