//! Ring alignment integration tests
//!
//! Exercises the store → aligner → store chain and the API surface the
//! outer layers consume, using seeded raw data instead of live collectors.

use std::sync::Arc;

use shield_edge::aligner::RingAligner;
use shield_edge::api::EdgeApi;
use shield_edge::config::GeoZone;
use shield_edge::{
    CompletenessFlag, ConfigHandle, EdgeConfig, EdgeStore, QualityFlag, RingFilter, Sample,
    TableKind,
};

struct Fixture {
    _dir: tempfile::TempDir,
    store: Arc<EdgeStore>,
    aligner: Arc<RingAligner>,
    api: EdgeApi,
}

fn fixture(mut cfg: EdgeConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    cfg.store.path = dir.path().join("edge.db");
    let store = Arc::new(EdgeStore::open(&cfg.store.path).unwrap());
    let config = ConfigHandle::new(cfg);
    let aligner = Arc::new(RingAligner::new(store.clone(), config.clone()));
    let api = EdgeApi::new(store.clone(), config, Vec::new(), Vec::new(), aligner.clone());
    Fixture {
        _dir: dir,
        store,
        aligner,
        api,
    }
}

fn plc(tag: &str, ts: i64, value: f64, ring: i64) -> Sample {
    let mut s = Sample::raw("plc_main", tag, ts, value);
    s.ring_number = Some(ring);
    s
}

/// Rings 100..100+n, 300 s each, full indicator and attitude coverage.
fn seed_rings(store: &EdgeStore, rings: i64) {
    let mut plc_rows = Vec::new();
    let mut att_rows = Vec::new();
    for i in 0..(rings * 300) {
        let ring = 100 + i / 300;
        let ts = i * 1_000;
        plc_rows.push(plc("ring_number", ts, ring as f64, ring));
        plc_rows.push(plc("thrust_total", ts, 10_000.0 + (i % 300) as f64, ring));
        plc_rows.push(plc("cutterhead_torque", ts, 3_000.0, ring));
        plc_rows.push(plc("chamber_pressure", ts, 2.1, ring));
        plc_rows.push(plc("advance_rate", ts, 12.0, ring));
        plc_rows.push(plc("cutterhead_speed", ts, 1.2, ring));
        for (tag, value) in [("pitch", 0.4), ("roll", -0.1), ("yaw", 0.2)] {
            let mut s = Sample::raw("guidance", tag, ts, value);
            s.ring_number = Some(ring);
            att_rows.push(s);
        }
    }
    store.insert_samples(TableKind::Plc, &plc_rows).unwrap();
    store.insert_samples(TableKind::Attitude, &att_rows).unwrap();
}

#[test]
fn test_summaries_through_api() {
    let mut cfg = EdgeConfig::default();
    cfg.aligner.zones.push(GeoZone {
        from_ring: 1,
        to_ring: 1_000,
        label: "silty sand".to_string(),
    });
    let f = fixture(cfg);
    // Four ring transitions seeded → rings 100..102 are complete (103 open).
    seed_rings(&f.store, 4);
    f.aligner.tick(2_000_000);

    let page = f.api.list_rings(&RingFilter::default()).unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(
        page.rings.iter().map(|r| r.ring_number).collect::<Vec<_>>(),
        vec![100, 101, 102]
    );
    for ring in &page.rings {
        // P2: every summary window is exactly one ring long.
        assert_eq!(ring.end_ts - ring.start_ts, 300_000);
        assert_eq!(ring.completeness, CompletenessFlag::MissingMonitoring);
        assert_eq!(ring.geological_zone.as_deref(), Some("silty sand"));
        assert!(ring.specific_energy.is_some());
    }

    let detail = f.api.get_ring(101, true).unwrap().unwrap();
    let counts = detail.raw_counts.unwrap();
    // 300 seconds × 6 PLC tags.
    assert_eq!(counts.plc, 1_800);
    assert_eq!(counts.attitude, 900);
    assert_eq!(counts.monitoring, 0);

    // Filtered listing.
    let page = f
        .api
        .list_rings(&RingFilter {
            min_ring: Some(101),
            ..RingFilter::default()
        })
        .unwrap();
    assert_eq!(page.total, 2);
}

#[test]
fn test_aligner_rerun_is_idempotent() {
    // P3: same raw data and boundaries → identical rows apart from
    // created_at bookkeeping.
    let f = fixture(EdgeConfig::default());
    seed_rings(&f.store, 2);

    f.aligner.tick(2_000_000);
    let first = f.store.get_summary(100).unwrap().unwrap();
    f.aligner.tick(3_000_000);
    let second = f.store.get_summary(100).unwrap().unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_delayed_settlement_promotes_completeness() {
    let f = fixture(EdgeConfig::default());
    seed_rings(&f.store, 2);
    f.aligner.tick(2_000_000);

    let before = f.api.get_ring(100, false).unwrap().unwrap().summary;
    assert_eq!(before.completeness, CompletenessFlag::MissingMonitoring);
    assert_eq!(before.settlement_value, None);

    // Settlement lands later, inside the lag window from ring start.
    f.store
        .insert_samples(
            TableKind::Monitoring,
            &[
                Sample::raw("survey_api", "settlement_value", 90_000, -2.7).with_unit("mm"),
                Sample::raw("survey_api", "displacement_value", 90_000, 0.9).with_unit("mm"),
            ],
        )
        .unwrap();

    f.aligner.tick(2_500_000);
    let after = f.api.get_ring(100, false).unwrap().unwrap().summary;
    assert_eq!(after.settlement_value, Some(-2.7));
    assert_eq!(after.displacement_value, Some(0.9));
    assert_eq!(after.completeness, CompletenessFlag::Complete);
    assert_eq!(after.created_at, before.created_at);

    // The update happens once; the row then stays stable.
    f.aligner.tick(2_600_000);
    let stable = f.api.get_ring(100, false).unwrap().unwrap().summary;
    assert_eq!(stable.updated_at, after.updated_at);
}

#[test]
fn test_manual_monitoring_feeds_next_alignment() {
    // P4 + alignment: an operator-entered settlement row behaves exactly
    // like a collected one.
    let f = fixture(EdgeConfig::default());
    seed_rings(&f.store, 2);

    let report = f
        .api
        .submit_manual_logs(&shield_edge::ManualBatch {
            monitoring_logs: vec![shield_edge::ManualLog {
                tag: "settlement_value".to_string(),
                timestamp_ms: 60_000,
                value: -1.8,
                location: Some("DB-7".to_string()),
                unit: Some("mm".to_string()),
            }],
            operator_id: "op-3".to_string(),
            ..shield_edge::ManualBatch::default()
        })
        .unwrap();
    assert_eq!(report.accepted, 1);

    f.aligner.tick(2_000_000);
    let summary = f.api.get_ring(100, false).unwrap().unwrap().summary;
    assert_eq!(summary.settlement_value, Some(-1.8));
    assert_eq!(summary.completeness, CompletenessFlag::Complete);
}

#[test]
fn test_excluded_flags_never_reach_aggregates() {
    let f = fixture(EdgeConfig::default());
    seed_rings(&f.store, 2);
    let mut spike = plc("thrust_total", 150_000, 1e9, 100);
    spike.quality = QualityFlag::PhysicallyImplausible;
    f.store.insert_samples(TableKind::Plc, &[spike]).unwrap();

    f.aligner.tick(2_000_000);
    let summary = f.store.get_summary(100).unwrap().unwrap();
    assert!(summary.thrust.max.unwrap() < 11_000.0);
}
