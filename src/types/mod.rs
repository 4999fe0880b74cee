//! Shared data types for the edge pipeline
//!
//! - Collectors produce `Sample`s
//! - The quality pipeline assigns each a `QualityFlag`
//! - The buffer writer routes them by `TableKind`
//! - The ring aligner turns them into `RingSummary` rows
//! - Every component exposes a small health struct merged into `HealthReport`

mod health;
mod ring;
mod sample;

pub use health::{AlignerHealth, BufferHealth, CollectorHealth, HealthLevel, HealthReport};
pub use ring::{Aggregate, CompletenessFlag, RingState, RingSummary};
pub use sample::{QualityFlag, Sample, SampleMeta, TableKind};

/// Current wall-clock time as epoch milliseconds.
///
/// All hot-path timestamps in this crate are epoch ms (`i64`); `chrono` is
/// reserved for human-facing formatting.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
