//! Local Store — embedded single-file database
//!
//! rusqlite with WAL journaling: one writer at a time (serialized through
//! the store's internal mutex, which is how the buffer-writer workers
//! coordinate), readers concurrent on their own connections. The database
//! file is the unit of backup; WAL and shared-memory sidecar files are
//! managed by SQLite.
//!
//! Failure semantics:
//! - busy/locked → bounded retry (3 attempts, 50/100/200 ms)
//! - corruption / disk full → the store flips to fatal; writers stop,
//!   readers keep working, the process stays up for inspection
//! - a corrupt file at startup aborts `open()` with a clear diagnostic

mod schema;
mod summaries;

pub use summaries::{RingFilter, RingPage};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags};

use crate::config::RetentionConfig;
use crate::types::{QualityFlag, Sample, SampleMeta, TableKind};

/// Delays between busy retries.
const BUSY_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(50),
    Duration::from_millis(100),
    Duration::from_millis(200),
];

/// Store errors, split by how they are handled.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database busy after {0} retries")]
    Busy(usize),
    #[error("database is fatal (corruption or disk full): {0}")]
    Fatal(String),
    #[error("database corrupt: {0}")]
    Corrupt(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle to the embedded database.
pub struct EdgeStore {
    path: PathBuf,
    writer: Mutex<Connection>,
    fatal: AtomicBool,
}

impl EdgeStore {
    /// Open (or create) the database, apply pragmas and migrations, and
    /// verify integrity. A corrupt file aborts here — recovery is an
    /// operator action, not an automatic one.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        Self::apply_pragmas(&conn)?;

        let verdict: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;
        if verdict != "ok" {
            return Err(StoreError::Corrupt(format!(
                "{}: quick_check reported '{verdict}' — run an integrity check out of band",
                path.display()
            )));
        }

        schema::migrate(&conn)?;
        tracing::info!(path = %path.display(), "Edge store opened");

        Ok(Self {
            path,
            writer: Mutex::new(conn),
            fatal: AtomicBool::new(false),
        })
    }

    fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
        // WAL so readers never block the single writer.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;")?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a fatal storage error (corruption, disk full) was seen.
    /// Once set, writers skip flush attempts; the flag is never cleared at
    /// runtime.
    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Relaxed)
    }

    /// Probe writability for the health surface.
    pub fn writable(&self) -> bool {
        if self.is_fatal() {
            return false;
        }
        let Ok(conn) = self.writer.lock() else {
            return false;
        };
        conn.execute_batch("BEGIN IMMEDIATE; ROLLBACK;").is_ok()
    }

    /// New read-only connection. WAL keeps these concurrent with the writer.
    fn read_conn(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(conn)
    }

    /// Run `op` against the writer connection with bounded busy retries.
    pub(crate) fn with_writer<T>(
        &self,
        op: impl Fn(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        if self.is_fatal() {
            return Err(StoreError::Fatal("store is in fatal state".to_string()));
        }
        let conn = self.writer.lock().expect("store writer mutex poisoned");
        let mut attempt = 0;
        loop {
            match op(&conn) {
                Ok(v) => return Ok(v),
                Err(e) => match self.classify(e) {
                    StoreError::Busy(_) if attempt < BUSY_RETRY_DELAYS.len() => {
                        std::thread::sleep(BUSY_RETRY_DELAYS[attempt]);
                        attempt += 1;
                    }
                    StoreError::Busy(_) => return Err(StoreError::Busy(attempt)),
                    other => return Err(other),
                },
            }
        }
    }

    /// Map a sqlite error to the failure taxonomy, latching the fatal flag.
    fn classify(&self, e: rusqlite::Error) -> StoreError {
        use rusqlite::ErrorCode;
        if let rusqlite::Error::SqliteFailure(ffi, _) = &e {
            match ffi.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    return StoreError::Busy(0);
                }
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase | ErrorCode::DiskFull => {
                    self.fatal.store(true, Ordering::Relaxed);
                    tracing::error!(error = %e, "Storage entered fatal state");
                    return StoreError::Fatal(e.to_string());
                }
                _ => {}
            }
        }
        StoreError::Sqlite(e)
    }

    // ------------------------------------------------------------------
    // Sample writes
    // ------------------------------------------------------------------

    /// Insert a batch of samples into `table` in a single transaction.
    ///
    /// Records flagged Missing are rejected by debug assertion — they must
    /// have been dropped upstream.
    pub fn insert_samples(&self, table: TableKind, samples: &[Sample]) -> Result<usize, StoreError> {
        debug_assert!(
            samples.iter().all(|s| s.quality != QualityFlag::Missing),
            "missing-flagged records must not reach the store"
        );
        if samples.is_empty() {
            return Ok(0);
        }
        let created_at = crate::types::now_ms();
        self.with_writer(|conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare_cached(insert_sql(table))?;
                for s in samples {
                    match table {
                        TableKind::Monitoring => stmt.execute(params![
                            s.timestamp_ms,
                            s.tag,
                            s.value,
                            s.original_value,
                            s.quality.as_str(),
                            s.ring_number,
                            s.source_id,
                            s.meta.location,
                            s.meta.unit,
                            created_at,
                        ])?,
                        _ => stmt.execute(params![
                            s.timestamp_ms,
                            s.tag,
                            s.value,
                            s.original_value,
                            s.quality.as_str(),
                            s.ring_number,
                            s.source_id,
                            created_at,
                        ])?,
                    };
                }
            }
            tx.commit()?;
            Ok(samples.len())
        })
    }

    /// Insert batches for several tables in one transaction — used by the
    /// manual-log surface, which must accept or persist atomically.
    pub fn insert_all(&self, batches: &[(TableKind, Vec<Sample>)]) -> Result<usize, StoreError> {
        let total: usize = batches.iter().map(|(_, b)| b.len()).sum();
        if total == 0 {
            return Ok(0);
        }
        let created_at = crate::types::now_ms();
        self.with_writer(|conn| {
            let tx = conn.unchecked_transaction()?;
            for (table, samples) in batches {
                let mut stmt = tx.prepare_cached(insert_sql(*table))?;
                for s in samples {
                    match table {
                        TableKind::Monitoring => stmt.execute(params![
                            s.timestamp_ms,
                            s.tag,
                            s.value,
                            s.original_value,
                            s.quality.as_str(),
                            s.ring_number,
                            s.source_id,
                            s.meta.location,
                            s.meta.unit,
                            created_at,
                        ])?,
                        _ => stmt.execute(params![
                            s.timestamp_ms,
                            s.tag,
                            s.value,
                            s.original_value,
                            s.quality.as_str(),
                            s.ring_number,
                            s.source_id,
                            created_at,
                        ])?,
                    };
                }
            }
            tx.commit()?;
            Ok(total)
        })
    }

    // ------------------------------------------------------------------
    // Sample reads
    // ------------------------------------------------------------------

    /// All samples in `[start_ms, end_ms)`, ordered by timestamp.
    pub fn query_range(
        &self,
        table: TableKind,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Sample>, StoreError> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE timestamp >= ?1 AND timestamp < ?2 ORDER BY timestamp",
            select_sql(table)
        ))?;
        let rows = stmt.query_map(params![start_ms, end_ms], |row| map_sample(table, row))?;
        collect_samples(rows)
    }

    /// Samples for one tag in `[start_ms, end_ms)`, ordered by timestamp.
    pub fn query_tag_range(
        &self,
        table: TableKind,
        tag: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Sample>, StoreError> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE tag = ?1 AND timestamp >= ?2 AND timestamp < ?3 ORDER BY timestamp",
            select_sql(table)
        ))?;
        let rows = stmt.query_map(params![tag, start_ms, end_ms], |row| map_sample(table, row))?;
        collect_samples(rows)
    }

    /// Row count in `[start_ms, end_ms)`.
    pub fn count_range(
        &self,
        table: TableKind,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<u64, StoreError> {
        let conn = self.read_conn()?;
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE timestamp >= ?1 AND timestamp < ?2",
                table.table_name()
            ),
            params![start_ms, end_ms],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Highest ring number stamped on any persisted PLC sample.
    pub fn max_ring_number(&self) -> Result<Option<i64>, StoreError> {
        let conn = self.read_conn()?;
        let max: Option<i64> =
            conn.query_row("SELECT MAX(ring_number) FROM plc_samples", [], |row| {
                row.get(0)
            })?;
        Ok(max)
    }

    /// Lowest ring number stamped on any persisted PLC sample.
    pub fn min_ring_number(&self) -> Result<Option<i64>, StoreError> {
        let conn = self.read_conn()?;
        let min: Option<i64> =
            conn.query_row("SELECT MIN(ring_number) FROM plc_samples", [], |row| {
                row.get(0)
            })?;
        Ok(min)
    }

    /// First timestamp at which the ring-number tag reported `ring`.
    ///
    /// This is the ring's start boundary; the transitioning sample belongs
    /// to the new ring.
    pub fn ring_start_ts(&self, ring_tag: &str, ring: i64) -> Result<Option<i64>, StoreError> {
        let conn = self.read_conn()?;
        let ts: Option<i64> = conn.query_row(
            "SELECT MIN(timestamp) FROM plc_samples WHERE tag = ?1 AND value = ?2",
            params![ring_tag, ring as f64],
            |row| row.get(0),
        )?;
        Ok(ts)
    }

    // ------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------

    /// Delete sample rows past their per-table retention. Ring summaries
    /// are never touched.
    pub fn retention_sweep(
        &self,
        retention: &RetentionConfig,
        now_ms: i64,
    ) -> Result<u64, StoreError> {
        let mut deleted = 0u64;
        for table in TableKind::ALL {
            let Some(days) = retention.days_for(table) else {
                continue;
            };
            let cutoff = now_ms - i64::from(days) * 86_400_000;
            let n = self.with_writer(|conn| {
                conn.execute(
                    &format!("DELETE FROM {} WHERE timestamp < ?1", table.table_name()),
                    params![cutoff],
                )
            })?;
            if n > 0 {
                tracing::info!(table = %table, deleted = n, "Retention sweep removed old rows");
            }
            deleted += n as u64;
        }
        Ok(deleted)
    }
}

fn insert_sql(table: TableKind) -> &'static str {
    match table {
        TableKind::Plc => {
            "INSERT INTO plc_samples
             (timestamp, tag, value, original_value, quality, ring_number, source_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        }
        TableKind::Attitude => {
            "INSERT INTO attitude_samples
             (timestamp, tag, value, original_value, quality, ring_number, source_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        }
        TableKind::Monitoring => {
            "INSERT INTO monitoring_samples
             (timestamp, tag, value, original_value, quality, ring_number, source_id,
              location, unit, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
        }
    }
}

fn select_sql(table: TableKind) -> String {
    let extra = match table {
        TableKind::Monitoring => ", location, unit",
        _ => "",
    };
    format!(
        "SELECT timestamp, tag, value, original_value, quality, ring_number, source_id{extra} FROM {}",
        table.table_name()
    )
}

fn map_sample(table: TableKind, row: &rusqlite::Row<'_>) -> rusqlite::Result<Sample> {
    let quality_text: String = row.get(4)?;
    let quality = QualityFlag::parse(&quality_text).unwrap_or(QualityFlag::Good);
    let meta = match table {
        TableKind::Monitoring => SampleMeta {
            register: None,
            location: row.get(7)?,
            unit: row.get(8)?,
        },
        _ => SampleMeta::default(),
    };
    Ok(Sample {
        timestamp_ms: row.get(0)?,
        tag: row.get(1)?,
        value: row.get(2)?,
        original_value: row.get(3)?,
        quality,
        ring_number: row.get(5)?,
        source_id: row.get(6)?,
        meta,
    })
}

fn collect_samples(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<Sample>>,
) -> Result<Vec<Sample>, StoreError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, EdgeStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = EdgeStore::open(dir.path().join("edge.db")).unwrap();
        (dir, store)
    }

    fn plc(tag: &str, ts: i64, value: f64, ring: i64) -> Sample {
        let mut s = Sample::raw("plc_main", tag, ts, value);
        s.ring_number = Some(ring);
        s
    }

    #[test]
    fn test_open_creates_file_and_wal() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert!(store.writable());
        assert!(!store.is_fatal());
    }

    #[test]
    fn test_insert_and_query_range() {
        let (_dir, store) = open_temp();
        let samples: Vec<Sample> = (0..10)
            .map(|i| plc("thrust_total", i * 1_000, 10_000.0 + i as f64, 100))
            .collect();
        assert_eq!(store.insert_samples(TableKind::Plc, &samples).unwrap(), 10);

        // [start, end) — the upper bound is exclusive.
        let rows = store.query_range(TableKind::Plc, 0, 5_000).unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0].timestamp_ms, 0);
        assert_eq!(rows[4].timestamp_ms, 4_000);
        assert_eq!(rows[0].quality, QualityFlag::Good);
    }

    #[test]
    fn test_query_tag_range() {
        let (_dir, store) = open_temp();
        store
            .insert_samples(
                TableKind::Plc,
                &[
                    plc("thrust_total", 1_000, 10_000.0, 1),
                    plc("cutterhead_torque", 1_000, 3_000.0, 1),
                ],
            )
            .unwrap();
        let rows = store
            .query_tag_range(TableKind::Plc, "thrust_total", 0, 10_000)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tag, "thrust_total");
    }

    #[test]
    fn test_monitoring_meta_roundtrip() {
        let (_dir, store) = open_temp();
        let sample = Sample::raw("survey_api", "settlement_value", 5_000, -2.7)
            .with_location("DB-12")
            .with_unit("mm");
        store
            .insert_samples(TableKind::Monitoring, &[sample.clone()])
            .unwrap();
        let rows = store.query_range(TableKind::Monitoring, 0, 10_000).unwrap();
        assert_eq!(rows[0].meta.location.as_deref(), Some("DB-12"));
        assert_eq!(rows[0].meta.unit.as_deref(), Some("mm"));
    }

    #[test]
    fn test_ring_boundary_lookup() {
        let (_dir, store) = open_temp();
        let mut samples = Vec::new();
        for i in 0..5 {
            samples.push(plc("ring_number", i * 1_000, 100.0, 100));
        }
        for i in 5..8 {
            samples.push(plc("ring_number", i * 1_000, 101.0, 101));
        }
        store.insert_samples(TableKind::Plc, &samples).unwrap();

        assert_eq!(store.max_ring_number().unwrap(), Some(101));
        assert_eq!(store.ring_start_ts("ring_number", 100).unwrap(), Some(0));
        assert_eq!(store.ring_start_ts("ring_number", 101).unwrap(), Some(5_000));
        assert_eq!(store.ring_start_ts("ring_number", 102).unwrap(), None);
    }

    #[test]
    fn test_retention_sweep() {
        let (_dir, store) = open_temp();
        let now = 10 * 86_400_000;
        store
            .insert_samples(
                TableKind::Plc,
                &[
                    plc("thrust_total", 1_000, 1.0, 1),
                    plc("thrust_total", now - 1_000, 2.0, 9),
                ],
            )
            .unwrap();
        let retention = RetentionConfig {
            plc_days: Some(7),
            ..RetentionConfig::default()
        };
        let deleted = store.retention_sweep(&retention, now).unwrap();
        assert_eq!(deleted, 1);
        let left = store.query_range(TableKind::Plc, 0, i64::MAX).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].value, 2.0);
    }

    #[test]
    fn test_concurrent_reader_during_writer() {
        let (_dir, store) = open_temp();
        store
            .insert_samples(TableKind::Plc, &[plc("thrust_total", 1_000, 1.0, 1)])
            .unwrap();
        // A reader connection opened while the writer mutex is held still
        // sees committed data (WAL).
        let _guard = store.writer.lock().unwrap();
        let rows = store.query_range(TableKind::Plc, 0, i64::MAX).unwrap();
        assert_eq!(rows.len(), 1);
    }
}
