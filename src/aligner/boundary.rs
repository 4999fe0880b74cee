//! Ring boundary tracking
//!
//! The ring counter comes from one PLC tag. The tracker stamps the current
//! ring onto samples at capture time and watches the counter itself:
//! ring numbers are dense and strictly increasing over the machine's
//! lifetime, so a decrease is a hard error surfaced to health — not a
//! silently handled restart.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// What one ring-counter reading meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingObservation {
    /// First reading, or same ring as before.
    Unchanged,
    /// Counter moved forward to this ring.
    Advanced(i64),
    /// Counter moved backward — hard error.
    Regressed { from: i64, to: i64 },
}

/// Shared, lock-free view of the current ring number.
#[derive(Debug, Default)]
pub struct RingTracker {
    /// 0 means "not yet observed"; real rings are >= 1.
    current: AtomicI64,
    regressed: AtomicBool,
}

impl RingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ring number at capture time, if the counter has been seen.
    pub fn current(&self) -> Option<i64> {
        match self.current.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n),
        }
    }

    /// Whether a backwards counter was ever observed.
    pub fn has_regressed(&self) -> bool {
        self.regressed.load(Ordering::Relaxed)
    }

    /// Feed one reading of the ring-number tag.
    pub fn observe(&self, value: f64) -> RingObservation {
        if !value.is_finite() || value < 1.0 {
            return RingObservation::Unchanged;
        }
        let ring = value as i64;
        let previous = self.current.load(Ordering::Relaxed);
        if previous == 0 {
            self.current.store(ring, Ordering::Relaxed);
            return RingObservation::Unchanged;
        }
        if ring > previous {
            self.current.store(ring, Ordering::Relaxed);
            if ring > previous + 1 {
                tracing::warn!(
                    from = previous,
                    to = ring,
                    "Ring counter skipped values — density invariant at risk"
                );
            }
            return RingObservation::Advanced(ring);
        }
        if ring < previous {
            self.regressed.store(true, Ordering::Relaxed);
            tracing::error!(
                from = previous,
                to = ring,
                "Ring counter decreased — operator reset? Treating as hard error"
            );
            return RingObservation::Regressed {
                from: previous,
                to: ring,
            };
        }
        RingObservation::Unchanged
    }
}
