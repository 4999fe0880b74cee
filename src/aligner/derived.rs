//! Derived engineering indicators
//!
//! Deterministic formulas over the per-ring aggregates. The rule for bad
//! inputs is uniform: a null input or a zero divisor yields a null
//! indicator — never NaN, never zero, never a sentinel.

use crate::config::RingGeometry;

/// Specific energy (kJ/m³):
///
/// `(mean_torque · 2π · revolutions) / (advance_distance · cross_section_area)`
///
/// where `revolutions = mean_cutterhead_speed [rpm] × duration [min]` and
/// the advance distance and cross-section come from the ring geometry.
pub fn specific_energy(
    mean_torque_knm: Option<f64>,
    mean_cutterhead_speed_rpm: Option<f64>,
    duration_minutes: f64,
    geometry: &RingGeometry,
) -> Option<f64> {
    let torque = mean_torque_knm?;
    let rpm = mean_cutterhead_speed_rpm?;
    let advance = geometry.ring_width_m;
    let area = geometry.cross_section_area_m2();
    if advance <= 0.0 || area <= 0.0 || duration_minutes <= 0.0 {
        return None;
    }
    let revolutions = rpm * duration_minutes;
    let energy_kj = torque * 2.0 * std::f64::consts::PI * revolutions;
    Some(energy_kj / (advance * area))
}

/// Ground loss (m³): grout injected beyond the theoretical tail void.
///
/// `ground_loss = mean_grout_volume − tail_void_volume`
pub fn ground_loss_rate(
    mean_grout_volume_m3: Option<f64>,
    geometry: &RingGeometry,
) -> Option<f64> {
    let grout = mean_grout_volume_m3?;
    Some(grout - geometry.tail_void_m3())
}

/// Volume loss ratio (%): ground loss relative to the excavated volume.
/// Negative ground loss reads as zero loss.
pub fn volume_loss_ratio(ground_loss_m3: Option<f64>, geometry: &RingGeometry) -> Option<f64> {
    let loss = ground_loss_m3?.max(0.0);
    let volume = geometry.excavation_volume_m3();
    if volume <= 0.0 {
        return None;
    }
    Some(loss / volume * 100.0)
}
