//! Per-ring statistical aggregation
//!
//! Reads raw samples inside a ring window and reduces each configured
//! indicator to mean/max/min/std. Records flagged out_of_range,
//! physically_implausible or missing are excluded; interpolated and
//! calibrated records count.

use crate::config::AlignerTags;
use crate::storage::{EdgeStore, StoreError};
use crate::types::{Aggregate, Sample, TableKind};

/// Time window of one ring: [start_ts, end_ts).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingWindow {
    pub ring: i64,
    pub start_ts: i64,
    pub end_ts: i64,
}

impl RingWindow {
    pub fn duration_minutes(&self) -> f64 {
        (self.end_ts - self.start_ts) as f64 / 60_000.0
    }
}

/// PLC indicator aggregates for one ring.
#[derive(Debug, Clone, Default)]
pub struct PlcAggregates {
    pub thrust: Aggregate,
    pub torque: Aggregate,
    pub chamber_pressure: Aggregate,
    pub advance_rate: Aggregate,
    pub grout_pressure: Aggregate,
    pub grout_volume: Aggregate,
    /// Used by specific energy, not persisted as its own columns.
    pub cutterhead_speed: Aggregate,
    /// Usable PLC rows seen in the window, across all tags.
    pub sample_count: u64,
}

/// Attitude aggregates for one ring.
#[derive(Debug, Clone, Default)]
pub struct AttitudeAggregates {
    pub mean_pitch: Option<f64>,
    pub mean_roll: Option<f64>,
    pub mean_yaw: Option<f64>,
    /// Largest absolute horizontal deviation.
    pub max_horizontal_deviation: Option<f64>,
    pub max_vertical_deviation: Option<f64>,
    pub sample_count: u64,
}

fn usable_values(samples: &[Sample]) -> Vec<f64> {
    samples
        .iter()
        .filter(|s| s.quality.counts_in_aggregates())
        .map(|s| s.value)
        .collect()
}

fn tag_aggregate(
    store: &EdgeStore,
    table: TableKind,
    tag: &str,
    window: &RingWindow,
    seen: &mut u64,
) -> Result<Aggregate, StoreError> {
    let samples = store.query_tag_range(table, tag, window.start_ts, window.end_ts)?;
    let values = usable_values(&samples);
    *seen += values.len() as u64;
    Ok(Aggregate::from_values(&values))
}

/// Aggregate the configured PLC indicators over a ring window.
pub fn aggregate_plc(
    store: &EdgeStore,
    window: &RingWindow,
    tags: &AlignerTags,
) -> Result<PlcAggregates, StoreError> {
    let mut seen = 0u64;
    let aggregates = PlcAggregates {
        thrust: tag_aggregate(store, TableKind::Plc, &tags.thrust, window, &mut seen)?,
        torque: tag_aggregate(store, TableKind::Plc, &tags.torque, window, &mut seen)?,
        chamber_pressure: tag_aggregate(
            store,
            TableKind::Plc,
            &tags.chamber_pressure,
            window,
            &mut seen,
        )?,
        advance_rate: tag_aggregate(store, TableKind::Plc, &tags.advance_rate, window, &mut seen)?,
        grout_pressure: tag_aggregate(
            store,
            TableKind::Plc,
            &tags.grout_pressure,
            window,
            &mut seen,
        )?,
        grout_volume: tag_aggregate(store, TableKind::Plc, &tags.grout_volume, window, &mut seen)?,
        cutterhead_speed: tag_aggregate(
            store,
            TableKind::Plc,
            &tags.cutterhead_speed,
            window,
            &mut seen,
        )?,
        sample_count: 0,
    };
    // The count covers every PLC row in the window, not only indicator
    // tags, so a ring with data under different names still reads as
    // "PLC present".
    let total = store.count_range(TableKind::Plc, window.start_ts, window.end_ts)?;
    Ok(PlcAggregates {
        sample_count: total,
        ..aggregates
    })
}

/// Aggregate attitude readings over a ring window.
pub fn aggregate_attitude(
    store: &EdgeStore,
    window: &RingWindow,
    tags: &AlignerTags,
) -> Result<AttitudeAggregates, StoreError> {
    let mut seen = 0u64;
    let pitch = tag_aggregate(store, TableKind::Attitude, &tags.pitch, window, &mut seen)?;
    let roll = tag_aggregate(store, TableKind::Attitude, &tags.roll, window, &mut seen)?;
    let yaw = tag_aggregate(store, TableKind::Attitude, &tags.yaw, window, &mut seen)?;

    let h_dev = store.query_tag_range(
        TableKind::Attitude,
        &tags.horizontal_deviation,
        window.start_ts,
        window.end_ts,
    )?;
    let v_dev = store.query_tag_range(
        TableKind::Attitude,
        &tags.vertical_deviation,
        window.start_ts,
        window.end_ts,
    )?;
    let max_abs = |samples: &[Sample]| {
        usable_values(samples)
            .into_iter()
            .map(f64::abs)
            .fold(None, |acc: Option<f64>, v| {
                Some(acc.map_or(v, |a| a.max(v)))
            })
    };

    let total = store.count_range(TableKind::Attitude, window.start_ts, window.end_ts)?;
    Ok(AttitudeAggregates {
        mean_pitch: pitch.mean,
        mean_roll: roll.mean,
        mean_yaw: yaw.mean,
        max_horizontal_deviation: max_abs(&h_dev),
        max_vertical_deviation: max_abs(&v_dev),
        sample_count: total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QualityFlag;

    fn temp_store() -> (tempfile::TempDir, EdgeStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = EdgeStore::open(dir.path().join("edge.db")).unwrap();
        (dir, store)
    }

    fn plc(tag: &str, ts: i64, value: f64, quality: QualityFlag) -> Sample {
        let mut s = Sample::raw("plc_main", tag, ts, value);
        s.quality = quality;
        s.ring_number = Some(100);
        s
    }

    #[test]
    fn test_flagged_records_excluded() {
        let (_dir, store) = temp_store();
        store
            .insert_samples(
                TableKind::Plc,
                &[
                    plc("thrust_total", 1_000, 10.0, QualityFlag::Good),
                    plc("thrust_total", 2_000, 20.0, QualityFlag::Interpolated),
                    plc("thrust_total", 3_000, 30.0, QualityFlag::CalibratedFromRaw),
                    plc("thrust_total", 4_000, 999.0, QualityFlag::OutOfRange),
                    plc("thrust_total", 5_000, 999.0, QualityFlag::PhysicallyImplausible),
                ],
            )
            .unwrap();

        let window = RingWindow {
            ring: 100,
            start_ts: 0,
            end_ts: 10_000,
        };
        let aggs = aggregate_plc(&store, &window, &crate::config::AlignerTags::default()).unwrap();
        // Only the good / interpolated / calibrated records count.
        assert_eq!(aggs.thrust.mean, Some(20.0));
        assert_eq!(aggs.thrust.max, Some(30.0));
        assert_eq!(aggs.thrust.min, Some(10.0));
        assert_eq!(aggs.sample_count, 5);
    }

    #[test]
    fn test_window_is_half_open() {
        let (_dir, store) = temp_store();
        store
            .insert_samples(
                TableKind::Plc,
                &[
                    plc("thrust_total", 0, 1.0, QualityFlag::Good),
                    plc("thrust_total", 9_999, 2.0, QualityFlag::Good),
                    plc("thrust_total", 10_000, 100.0, QualityFlag::Good),
                ],
            )
            .unwrap();
        let window = RingWindow {
            ring: 100,
            start_ts: 0,
            end_ts: 10_000,
        };
        let aggs = aggregate_plc(&store, &window, &crate::config::AlignerTags::default()).unwrap();
        assert_eq!(aggs.thrust.mean, Some(1.5));
    }

    #[test]
    fn test_attitude_max_uses_absolute_deviation() {
        let (_dir, store) = temp_store();
        let mut rows = Vec::new();
        for (ts, pitch) in [(1_000, 0.5), (2_000, 0.7)] {
            rows.push(plc("pitch", ts, pitch, QualityFlag::Good));
        }
        rows.push(plc("horizontal_deviation", 1_000, -35.0, QualityFlag::Good));
        rows.push(plc("horizontal_deviation", 2_000, 12.0, QualityFlag::Good));
        store.insert_samples(TableKind::Attitude, &rows).unwrap();

        let window = RingWindow {
            ring: 100,
            start_ts: 0,
            end_ts: 10_000,
        };
        let aggs =
            aggregate_attitude(&store, &window, &crate::config::AlignerTags::default()).unwrap();
        assert!((aggs.mean_pitch.unwrap() - 0.6).abs() < 1e-12);
        assert_eq!(aggs.max_horizontal_deviation, Some(35.0));
        assert_eq!(aggs.max_vertical_deviation, None);
    }

    #[test]
    fn test_empty_window_is_null() {
        let (_dir, store) = temp_store();
        let window = RingWindow {
            ring: 1,
            start_ts: 0,
            end_ts: 1_000,
        };
        let aggs = aggregate_plc(&store, &window, &crate::config::AlignerTags::default()).unwrap();
        assert!(aggs.thrust.is_null());
        assert_eq!(aggs.sample_count, 0);
    }
}
