//! Component health surfaces
//!
//! Each component exposes a small health struct; `api::health()` merges
//! them into one report for the dashboard / operator layers.

use serde::{Deserialize, Serialize};

/// Coarse component condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Ok,
    /// Recoverable trouble — reconnecting source, elevated error rate.
    Degraded,
    /// Needs operator attention — storage fatal, ring counter went backwards.
    Critical,
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthLevel::Ok => write!(f, "ok"),
            HealthLevel::Degraded => write!(f, "degraded"),
            HealthLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Health of one source collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorHealth {
    pub source_id: String,
    pub connected: bool,
    /// Epoch ms of the last sample produced, if any.
    pub last_sample_ts: Option<i64>,
    /// Errors per second over the trailing 60 s window.
    pub error_rate_last_60s: f64,
}

/// Health of one buffer-writer worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferHealth {
    pub table: String,
    pub depth: usize,
    pub last_flush_ts: Option<i64>,
    pub poisoned_batches: u64,
}

/// Health of the ring aligner job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlignerHealth {
    pub last_tick_ts: Option<i64>,
    pub rings_summarized: u64,
    pub last_error: Option<String>,
}

/// Merged report returned by `api::health()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub level: HealthLevel,
    pub collectors: Vec<CollectorHealth>,
    pub buffers: Vec<BufferHealth>,
    pub aligner: AlignerHealth,
    pub db_writable: bool,
}

impl HealthReport {
    /// Derive the overall level from the component details.
    pub fn resolve_level(&mut self) {
        if !self.db_writable {
            self.level = HealthLevel::Critical;
            return;
        }
        let degraded = self.collectors.iter().any(|c| !c.connected)
            || self.aligner.last_error.is_some();
        self.level = if degraded {
            HealthLevel::Degraded
        } else {
            HealthLevel::Ok
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> HealthReport {
        HealthReport {
            level: HealthLevel::Ok,
            collectors: vec![CollectorHealth {
                source_id: "plc_main".to_string(),
                connected: true,
                last_sample_ts: Some(1_000),
                error_rate_last_60s: 0.0,
            }],
            buffers: Vec::new(),
            aligner: AlignerHealth::default(),
            db_writable: true,
        }
    }

    #[test]
    fn test_level_ok() {
        let mut r = report();
        r.resolve_level();
        assert_eq!(r.level, HealthLevel::Ok);
    }

    #[test]
    fn test_disconnected_collector_degrades() {
        let mut r = report();
        r.collectors[0].connected = false;
        r.resolve_level();
        assert_eq!(r.level, HealthLevel::Degraded);
    }

    #[test]
    fn test_unwritable_db_is_critical() {
        let mut r = report();
        r.db_writable = false;
        r.resolve_level();
        assert_eq!(r.level, HealthLevel::Critical);
    }
}
