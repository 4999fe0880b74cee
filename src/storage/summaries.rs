//! Ring summary persistence
//!
//! Append-then-maybe-update-once: `insert_summary` creates the row,
//! `update_summary` refreshes it while it is still open (not finalized),
//! `finalize_expired` closes rows whose grace window has elapsed. Summary
//! rows are never deleted.

use rusqlite::{params, Row};

use crate::types::{Aggregate, CompletenessFlag, RingSummary};

use super::{EdgeStore, StoreError};

/// Filter for `list_summaries`. All fields optional; `limit` defaults
/// to 100 rows per page.
#[derive(Debug, Clone, Default)]
pub struct RingFilter {
    pub min_ring: Option<i64>,
    pub max_ring: Option<i64>,
    pub completeness: Option<CompletenessFlag>,
    pub synced: Option<bool>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// One page of summaries plus the total row count matching the filter.
#[derive(Debug, Clone)]
pub struct RingPage {
    pub rings: Vec<RingSummary>,
    pub total: u64,
}

const SUMMARY_COLUMNS: &str = "\
ring_number, start_ts, end_ts, \
mean_thrust, max_thrust, min_thrust, std_thrust, \
mean_torque, max_torque, min_torque, std_torque, \
mean_chamber_pressure, max_chamber_pressure, min_chamber_pressure, std_chamber_pressure, \
mean_advance_rate, max_advance_rate, min_advance_rate, std_advance_rate, \
mean_grout_pressure, max_grout_pressure, min_grout_pressure, std_grout_pressure, \
mean_grout_volume, max_grout_volume, min_grout_volume, std_grout_volume, \
mean_pitch, mean_roll, mean_yaw, max_horizontal_deviation, max_vertical_deviation, \
settlement_value, displacement_value, groundwater_level, \
specific_energy, ground_loss_rate, volume_loss_ratio, \
geological_zone, completeness, created_at, updated_at, finalized, synced_to_cloud";

impl EdgeStore {
    /// Insert a freshly aggregated summary row.
    pub fn insert_summary(&self, summary: &RingSummary) -> Result<(), StoreError> {
        self.with_writer(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO ring_summaries ({SUMMARY_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                      ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, \
                      ?30, ?31, ?32, ?33, ?34, ?35, ?36, ?37, ?38, ?39, ?40, ?41, ?42, ?43, ?44)"
                ),
                summary_params(summary).as_slice(),
            )?;
            Ok(())
        })
    }

    /// Refresh a still-open summary row. Returns false when the row is
    /// already finalized (or absent) — immutability is enforced here.
    pub fn update_summary(&self, summary: &RingSummary) -> Result<bool, StoreError> {
        let changed = self.with_writer(|conn| {
            conn.execute(
                "UPDATE ring_summaries SET \
                 start_ts = ?2, end_ts = ?3, \
                 mean_thrust = ?4, max_thrust = ?5, min_thrust = ?6, std_thrust = ?7, \
                 mean_torque = ?8, max_torque = ?9, min_torque = ?10, std_torque = ?11, \
                 mean_chamber_pressure = ?12, max_chamber_pressure = ?13, \
                 min_chamber_pressure = ?14, std_chamber_pressure = ?15, \
                 mean_advance_rate = ?16, max_advance_rate = ?17, \
                 min_advance_rate = ?18, std_advance_rate = ?19, \
                 mean_grout_pressure = ?20, max_grout_pressure = ?21, \
                 min_grout_pressure = ?22, std_grout_pressure = ?23, \
                 mean_grout_volume = ?24, max_grout_volume = ?25, \
                 min_grout_volume = ?26, std_grout_volume = ?27, \
                 mean_pitch = ?28, mean_roll = ?29, mean_yaw = ?30, \
                 max_horizontal_deviation = ?31, max_vertical_deviation = ?32, \
                 settlement_value = ?33, displacement_value = ?34, groundwater_level = ?35, \
                 specific_energy = ?36, ground_loss_rate = ?37, volume_loss_ratio = ?38, \
                 geological_zone = ?39, completeness = ?40, updated_at = ?41 \
                 WHERE ring_number = ?1 AND finalized = 0",
                update_params(summary).as_slice(),
            )
        })?;
        Ok(changed > 0)
    }

    pub fn get_summary(&self, ring_number: i64) -> Result<Option<RingSummary>, StoreError> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM ring_summaries WHERE ring_number = ?1"
        ))?;
        let mut rows = stmt.query_map(params![ring_number], map_summary)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Highest ring number with a summary row.
    pub fn max_summarized_ring(&self) -> Result<Option<i64>, StoreError> {
        let conn = self.read_conn()?;
        let max: Option<i64> =
            conn.query_row("SELECT MAX(ring_number) FROM ring_summaries", [], |row| {
                row.get(0)
            })?;
        Ok(max)
    }

    /// Summaries still inside their grace window (candidates for a late
    /// settlement re-attempt).
    pub fn open_summaries(&self) -> Result<Vec<RingSummary>, StoreError> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM ring_summaries WHERE finalized = 0 ORDER BY ring_number"
        ))?;
        let rows = stmt.query_map([], map_summary)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Close every open row whose grace window has elapsed. Returns the
    /// number of rows finalized.
    pub fn finalize_expired(&self, now_ms: i64, grace_ms: i64) -> Result<u64, StoreError> {
        let n = self.with_writer(|conn| {
            conn.execute(
                "UPDATE ring_summaries SET finalized = 1
                 WHERE finalized = 0 AND created_at + ?1 <= ?2",
                params![grace_ms, now_ms],
            )
        })?;
        Ok(n as u64)
    }

    /// Operator override: close one row immediately.
    pub fn mark_finalized(&self, ring_number: i64) -> Result<bool, StoreError> {
        let n = self.with_writer(|conn| {
            conn.execute(
                "UPDATE ring_summaries SET finalized = 1 WHERE ring_number = ?1",
                params![ring_number],
            )
        })?;
        Ok(n > 0)
    }

    /// Record that the cloud sync layer uploaded a summary.
    pub fn mark_synced(&self, ring_number: i64) -> Result<bool, StoreError> {
        let n = self.with_writer(|conn| {
            conn.execute(
                "UPDATE ring_summaries SET synced_to_cloud = 1 WHERE ring_number = ?1",
                params![ring_number],
            )
        })?;
        Ok(n > 0)
    }

    /// Paginated summary listing.
    pub fn list_summaries(&self, filter: &RingFilter) -> Result<RingPage, StoreError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(min) = filter.min_ring {
            args.push(Box::new(min));
            clauses.push(format!("ring_number >= ?{}", args.len()));
        }
        if let Some(max) = filter.max_ring {
            args.push(Box::new(max));
            clauses.push(format!("ring_number <= ?{}", args.len()));
        }
        if let Some(flag) = filter.completeness {
            args.push(Box::new(flag.as_str().to_string()));
            clauses.push(format!("completeness = ?{}", args.len()));
        }
        if let Some(synced) = filter.synced {
            args.push(Box::new(i64::from(synced)));
            clauses.push(format!("synced_to_cloud = ?{}", args.len()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let conn = self.read_conn()?;
        let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM ring_summaries{where_sql}"),
            params_ref.as_slice(),
            |row| row.get(0),
        )?;

        let limit = filter.limit.unwrap_or(100);
        let offset = filter.offset.unwrap_or(0);
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM ring_summaries{where_sql} \
             ORDER BY ring_number LIMIT {limit} OFFSET {offset}"
        ))?;
        let rows = stmt.query_map(params_ref.as_slice(), map_summary)?;
        let mut rings = Vec::new();
        for row in rows {
            rings.push(row?);
        }
        Ok(RingPage {
            rings,
            total: total as u64,
        })
    }
}

fn summary_params(s: &RingSummary) -> [&dyn rusqlite::ToSql; 44] {
    [
        &s.ring_number,
        &s.start_ts,
        &s.end_ts,
        &s.thrust.mean,
        &s.thrust.max,
        &s.thrust.min,
        &s.thrust.std,
        &s.torque.mean,
        &s.torque.max,
        &s.torque.min,
        &s.torque.std,
        &s.chamber_pressure.mean,
        &s.chamber_pressure.max,
        &s.chamber_pressure.min,
        &s.chamber_pressure.std,
        &s.advance_rate.mean,
        &s.advance_rate.max,
        &s.advance_rate.min,
        &s.advance_rate.std,
        &s.grout_pressure.mean,
        &s.grout_pressure.max,
        &s.grout_pressure.min,
        &s.grout_pressure.std,
        &s.grout_volume.mean,
        &s.grout_volume.max,
        &s.grout_volume.min,
        &s.grout_volume.std,
        &s.mean_pitch,
        &s.mean_roll,
        &s.mean_yaw,
        &s.max_horizontal_deviation,
        &s.max_vertical_deviation,
        &s.settlement_value,
        &s.displacement_value,
        &s.groundwater_level,
        &s.specific_energy,
        &s.ground_loss_rate,
        &s.volume_loss_ratio,
        &s.geological_zone,
        &s.completeness,
        &s.created_at,
        &s.updated_at,
        &s.finalized,
        &s.synced_to_cloud,
    ]
}

fn update_params(s: &RingSummary) -> [&dyn rusqlite::ToSql; 41] {
    [
        &s.ring_number,
        &s.start_ts,
        &s.end_ts,
        &s.thrust.mean,
        &s.thrust.max,
        &s.thrust.min,
        &s.thrust.std,
        &s.torque.mean,
        &s.torque.max,
        &s.torque.min,
        &s.torque.std,
        &s.chamber_pressure.mean,
        &s.chamber_pressure.max,
        &s.chamber_pressure.min,
        &s.chamber_pressure.std,
        &s.advance_rate.mean,
        &s.advance_rate.max,
        &s.advance_rate.min,
        &s.advance_rate.std,
        &s.grout_pressure.mean,
        &s.grout_pressure.max,
        &s.grout_pressure.min,
        &s.grout_pressure.std,
        &s.grout_volume.mean,
        &s.grout_volume.max,
        &s.grout_volume.min,
        &s.grout_volume.std,
        &s.mean_pitch,
        &s.mean_roll,
        &s.mean_yaw,
        &s.max_horizontal_deviation,
        &s.max_vertical_deviation,
        &s.settlement_value,
        &s.displacement_value,
        &s.groundwater_level,
        &s.specific_energy,
        &s.ground_loss_rate,
        &s.volume_loss_ratio,
        &s.geological_zone,
        &s.completeness,
        &s.updated_at,
    ]
}

impl rusqlite::ToSql for CompletenessFlag {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

fn map_summary(row: &Row<'_>) -> rusqlite::Result<RingSummary> {
    let completeness_text: String = row.get(39)?;
    Ok(RingSummary {
        ring_number: row.get(0)?,
        start_ts: row.get(1)?,
        end_ts: row.get(2)?,
        thrust: aggregate(row, 3)?,
        torque: aggregate(row, 7)?,
        chamber_pressure: aggregate(row, 11)?,
        advance_rate: aggregate(row, 15)?,
        grout_pressure: aggregate(row, 19)?,
        grout_volume: aggregate(row, 23)?,
        mean_pitch: row.get(27)?,
        mean_roll: row.get(28)?,
        mean_yaw: row.get(29)?,
        max_horizontal_deviation: row.get(30)?,
        max_vertical_deviation: row.get(31)?,
        settlement_value: row.get(32)?,
        displacement_value: row.get(33)?,
        groundwater_level: row.get(34)?,
        specific_energy: row.get(35)?,
        ground_loss_rate: row.get(36)?,
        volume_loss_ratio: row.get(37)?,
        geological_zone: row.get(38)?,
        completeness: CompletenessFlag::parse(&completeness_text)
            .unwrap_or(CompletenessFlag::MissingPlc),
        created_at: row.get(40)?,
        updated_at: row.get(41)?,
        finalized: row.get(42)?,
        synced_to_cloud: row.get(43)?,
    })
}

fn aggregate(row: &Row<'_>, base: usize) -> rusqlite::Result<Aggregate> {
    Ok(Aggregate {
        mean: row.get(base)?,
        max: row.get(base + 1)?,
        min: row.get(base + 2)?,
        std: row.get(base + 3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, EdgeStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = EdgeStore::open(dir.path().join("edge.db")).unwrap();
        (dir, store)
    }

    fn summary(ring: i64) -> RingSummary {
        let mut s = RingSummary::empty(ring, ring * 300_000, (ring + 1) * 300_000, 1_000_000);
        s.thrust = Aggregate::from_values(&[10_000.0, 10_100.0]);
        s.completeness = CompletenessFlag::MissingMonitoring;
        s
    }

    #[test]
    fn test_insert_and_get_roundtrip() {
        let (_dir, store) = open_temp();
        let original = summary(100);
        store.insert_summary(&original).unwrap();
        let loaded = store.get_summary(100).unwrap().unwrap();
        assert_eq!(loaded, original);
        assert!(store.get_summary(101).unwrap().is_none());
    }

    #[test]
    fn test_update_only_while_open() {
        let (_dir, store) = open_temp();
        let mut s = summary(200);
        store.insert_summary(&s).unwrap();

        s.settlement_value = Some(-2.7);
        s.completeness = CompletenessFlag::Complete;
        assert!(store.update_summary(&s).unwrap());

        store.mark_finalized(200).unwrap();
        s.settlement_value = Some(-99.0);
        assert!(!store.update_summary(&s).unwrap());
        let loaded = store.get_summary(200).unwrap().unwrap();
        assert_eq!(loaded.settlement_value, Some(-2.7));
    }

    #[test]
    fn test_finalize_expired() {
        let (_dir, store) = open_temp();
        store.insert_summary(&summary(1)).unwrap(); // created_at = 1_000_000
        let grace = 3_600_000;
        assert_eq!(store.finalize_expired(1_000_000 + grace - 1, grace).unwrap(), 0);
        assert_eq!(store.finalize_expired(1_000_000 + grace, grace).unwrap(), 1);
        assert!(store.open_summaries().unwrap().is_empty());
    }

    #[test]
    fn test_list_filters_and_pagination() {
        let (_dir, store) = open_temp();
        for ring in 1..=10 {
            let mut s = summary(ring);
            if ring <= 5 {
                s.completeness = CompletenessFlag::Complete;
            }
            store.insert_summary(&s).unwrap();
        }
        store.mark_synced(1).unwrap();

        let page = store
            .list_summaries(&RingFilter {
                completeness: Some(CompletenessFlag::Complete),
                ..RingFilter::default()
            })
            .unwrap();
        assert_eq!(page.total, 5);

        let page = store
            .list_summaries(&RingFilter {
                min_ring: Some(3),
                max_ring: Some(8),
                limit: Some(2),
                offset: Some(2),
                ..RingFilter::default()
            })
            .unwrap();
        assert_eq!(page.total, 6);
        assert_eq!(page.rings.len(), 2);
        assert_eq!(page.rings[0].ring_number, 5);

        let page = store
            .list_summaries(&RingFilter {
                synced: Some(true),
                ..RingFilter::default()
            })
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.rings[0].ring_number, 1);
    }

    #[test]
    fn test_max_summarized_ring() {
        let (_dir, store) = open_temp();
        assert_eq!(store.max_summarized_ring().unwrap(), None);
        store.insert_summary(&summary(7)).unwrap();
        store.insert_summary(&summary(9)).unwrap();
        assert_eq!(store.max_summarized_ring().unwrap(), Some(9));
    }
}
