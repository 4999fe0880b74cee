//! Poison batch sidecar
//!
//! Batches that failed to flush twice are appended here instead of being
//! lost. Files are named by the poisoning timestamp; each line is one
//! serialized batch (JSON), so an operator tool can replay them after the
//! storage problem is resolved.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{Sample, TableKind};

/// One failed batch as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoisonBatch {
    pub table: TableKind,
    /// Epoch ms when the batch was poisoned.
    pub poisoned_at: i64,
    /// Same instant, RFC 3339 — for the operator reading the file.
    pub poisoned_at_utc: String,
    pub samples: Vec<Sample>,
}

/// Append a failed batch to the poison directory. Returns the file path.
pub fn append_batch(
    dir: &Path,
    table: TableKind,
    samples: &[Sample],
    poisoned_at: i64,
) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{poisoned_at}-{}.jsonl", table.table_name()));
    let batch = PoisonBatch {
        table,
        poisoned_at,
        poisoned_at_utc: chrono::DateTime::from_timestamp_millis(poisoned_at)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default(),
        samples: samples.to_vec(),
    };
    let line = serde_json::to_string(&batch)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    writeln!(file, "{line}")?;
    file.sync_all()?;

    tracing::warn!(
        table = %table,
        records = samples.len(),
        path = %path.display(),
        "Batch poisoned after repeated flush failure"
    );
    Ok(path)
}

/// Load every poison batch under `dir`, oldest file first. Unparseable
/// lines are skipped with a warning — recovery must not fail on one bad
/// line.
pub fn read_batches(dir: &Path) -> std::io::Result<Vec<PoisonBatch>> {
    let mut paths: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "jsonl").unwrap_or(false))
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    paths.sort();

    let mut batches = Vec::new();
    for path in paths {
        let content = std::fs::read_to_string(&path)?;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<PoisonBatch>(line) {
                Ok(batch) => batches.push(batch),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping bad poison line");
                }
            }
        }
    }
    Ok(batches)
}
