//! Time-lag settlement association
//!
//! Surface settlement shows up minutes to hours after a ring is built, so
//! monitoring samples are associated by a lag window anchored at the ring
//! start: `[start_ts, start_ts + settlement_lag_window)` — inclusive lower
//! bound, exclusive upper bound. The first valid reading per tag wins;
//! absence stays null and is re-attempted once while the summary row is
//! still inside its grace window.

use crate::config::AlignerTags;
use crate::storage::{EdgeStore, StoreError};
use crate::types::TableKind;

/// Monitoring values associated with one ring.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SettlementReading {
    pub settlement: Option<f64>,
    pub displacement: Option<f64>,
    pub groundwater: Option<f64>,
}

impl SettlementReading {
    pub fn found(&self) -> bool {
        self.settlement.is_some()
    }
}

/// First valid reading per monitoring tag inside the lag window.
pub fn associate(
    store: &EdgeStore,
    start_ts: i64,
    lag_window_ms: i64,
    tags: &AlignerTags,
) -> Result<SettlementReading, StoreError> {
    let end = start_ts + lag_window_ms;
    let first_valid = |tag: &str| -> Result<Option<f64>, StoreError> {
        let samples = store.query_tag_range(TableKind::Monitoring, tag, start_ts, end)?;
        Ok(samples
            .iter()
            .find(|s| s.quality.counts_in_aggregates() && s.value.is_finite())
            .map(|s| s.value))
    };

    Ok(SettlementReading {
        settlement: first_valid(&tags.settlement)?,
        displacement: first_valid(&tags.displacement)?,
        groundwater: first_valid(&tags.groundwater)?,
    })
}
