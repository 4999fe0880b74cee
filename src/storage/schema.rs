//! Schema definition and migration runner
//!
//! Conventions:
//! - Timestamps are epoch milliseconds (INTEGER) for hot-path queries
//! - Quality / completeness flags are stored as their stable text names
//! - Every sample table is indexed on (timestamp); PLC additionally on
//!   (tag, timestamp) for the aligner's boundary and aggregate queries
//!
//! Migrations are ordered and idempotent; applied versions are recorded in
//! `schema_migrations` so a restart re-applies nothing.

use rusqlite::Connection;

/// One ordered migration step.
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, oldest first. Append-only — never edit a shipped step.
pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "initial sample tables and ring summaries",
    sql: r#"
CREATE TABLE IF NOT EXISTS plc_samples (
    id INTEGER PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    tag TEXT NOT NULL,
    value REAL NOT NULL,
    original_value REAL,
    quality TEXT NOT NULL,
    ring_number INTEGER,
    source_id TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_plc_timestamp ON plc_samples(timestamp);
CREATE INDEX IF NOT EXISTS idx_plc_tag_timestamp ON plc_samples(tag, timestamp);
CREATE INDEX IF NOT EXISTS idx_plc_ring ON plc_samples(ring_number);

CREATE TABLE IF NOT EXISTS attitude_samples (
    id INTEGER PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    tag TEXT NOT NULL,
    value REAL NOT NULL,
    original_value REAL,
    quality TEXT NOT NULL,
    ring_number INTEGER,
    source_id TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attitude_timestamp ON attitude_samples(timestamp);

CREATE TABLE IF NOT EXISTS monitoring_samples (
    id INTEGER PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    tag TEXT NOT NULL,
    value REAL NOT NULL,
    original_value REAL,
    quality TEXT NOT NULL,
    ring_number INTEGER,
    source_id TEXT NOT NULL,
    location TEXT,
    unit TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_monitoring_timestamp ON monitoring_samples(timestamp);
CREATE INDEX IF NOT EXISTS idx_monitoring_tag_timestamp ON monitoring_samples(tag, timestamp);

CREATE TABLE IF NOT EXISTS ring_summaries (
    ring_number INTEGER PRIMARY KEY,
    start_ts INTEGER NOT NULL,
    end_ts INTEGER NOT NULL,

    mean_thrust REAL, max_thrust REAL, min_thrust REAL, std_thrust REAL,
    mean_torque REAL, max_torque REAL, min_torque REAL, std_torque REAL,
    mean_chamber_pressure REAL, max_chamber_pressure REAL,
    min_chamber_pressure REAL, std_chamber_pressure REAL,
    mean_advance_rate REAL, max_advance_rate REAL,
    min_advance_rate REAL, std_advance_rate REAL,
    mean_grout_pressure REAL, max_grout_pressure REAL,
    min_grout_pressure REAL, std_grout_pressure REAL,
    mean_grout_volume REAL, max_grout_volume REAL,
    min_grout_volume REAL, std_grout_volume REAL,

    mean_pitch REAL, mean_roll REAL, mean_yaw REAL,
    max_horizontal_deviation REAL, max_vertical_deviation REAL,

    settlement_value REAL,
    displacement_value REAL,
    groundwater_level REAL,

    specific_energy REAL,
    ground_loss_rate REAL,
    volume_loss_ratio REAL,

    geological_zone TEXT,
    completeness TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    finalized INTEGER NOT NULL DEFAULT 0,
    synced_to_cloud INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_ring_synced ON ring_summaries(synced_to_cloud);
CREATE INDEX IF NOT EXISTS idx_ring_completeness ON ring_summaries(completeness);
"#,
}];

/// Apply any migrations newer than what the database has seen.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        );",
    )?;

    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "Applying schema migration"
        );
        conn.execute_batch("BEGIN")?;
        let applied = conn
            .execute_batch(migration.sql)
            .and_then(|()| {
                conn.execute(
                    "INSERT INTO schema_migrations (version, description, applied_at)
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![
                        migration.version,
                        migration.description,
                        crate::types::now_ms()
                    ],
                )
            });
        match applied {
            Ok(_) => conn.execute_batch("COMMIT")?,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e);
            }
        }
    }
    Ok(())
}
