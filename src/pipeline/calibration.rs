//! Stage 4 — linear calibration
//!
//! `corrected = offset + scale × raw`. The raw reading is preserved on the
//! record; only records that were still plain Good gain the
//! `calibrated_from_raw` marker (an interpolated record keeps its flag —
//! the preserved original still documents the transform).

use crate::config::Calibration;
use crate::types::{QualityFlag, Sample};

/// Apply a linear calibration to a raw value.
pub fn apply(cal: &Calibration, raw: f64) -> f64 {
    cal.offset + cal.scale * raw
}

/// Calibrate a sample in place. No-op when `cal` is `None`.
pub fn apply_to_sample(sample: &mut Sample, cal: Option<&Calibration>) {
    let Some(cal) = cal else {
        return;
    };
    sample.original_value = Some(sample.value);
    sample.value = apply(cal, sample.value);
    if sample.quality == QualityFlag::Good {
        sample.quality = QualityFlag::CalibratedFromRaw;
    }
}
