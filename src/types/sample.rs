//! Sample types shared across collectors, pipeline, buffer, and store

use serde::{Deserialize, Serialize};

/// Quality verdict on a sample.
///
/// Assigned by the quality pipeline and immutable once the record is
/// persisted. The ring aligner excludes `OutOfRange`, `PhysicallyImplausible`
/// and `Missing` records from aggregates; `Interpolated` and
/// `CalibratedFromRaw` records are counted as usable data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    /// Passed every stage unchanged.
    Good,
    /// Value was imputed from neighbouring good samples.
    Interpolated,
    /// Value outside the configured [min, max] engineering envelope.
    OutOfRange,
    /// Violated a rate-of-change or cross-tag physics rule.
    PhysicallyImplausible,
    /// A calibration transform was applied; the raw reading is preserved
    /// in `original_value`.
    CalibratedFromRaw,
    /// No usable value. Never persisted — used only for downstream
    /// accounting of failed reads.
    Missing,
}

impl QualityFlag {
    /// Whether a record carrying this flag counts toward ring aggregates.
    pub fn counts_in_aggregates(self) -> bool {
        matches!(
            self,
            QualityFlag::Good | QualityFlag::Interpolated | QualityFlag::CalibratedFromRaw
        )
    }

    /// Stable lowercase name used in the database `quality` column.
    pub fn as_str(self) -> &'static str {
        match self {
            QualityFlag::Good => "good",
            QualityFlag::Interpolated => "interpolated",
            QualityFlag::OutOfRange => "out_of_range",
            QualityFlag::PhysicallyImplausible => "physically_implausible",
            QualityFlag::CalibratedFromRaw => "calibrated_from_raw",
            QualityFlag::Missing => "missing",
        }
    }

    /// Parse the database representation back into a flag.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "good" => QualityFlag::Good,
            "interpolated" => QualityFlag::Interpolated,
            "out_of_range" => QualityFlag::OutOfRange,
            "physically_implausible" => QualityFlag::PhysicallyImplausible,
            "calibrated_from_raw" => QualityFlag::CalibratedFromRaw,
            "missing" => QualityFlag::Missing,
            _ => return None,
        })
    }
}

impl std::fmt::Display for QualityFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination table for a sample, fixed per data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    /// High-frequency machine telemetry (~1 Hz).
    Plc,
    /// Shield attitude / guidance readings (~1 Hz).
    Attitude,
    /// Surface monitoring instruments (1/min to 1/hr).
    Monitoring,
}

impl TableKind {
    pub const ALL: [TableKind; 3] = [TableKind::Plc, TableKind::Attitude, TableKind::Monitoring];

    pub fn table_name(self) -> &'static str {
        match self {
            TableKind::Plc => "plc_samples",
            TableKind::Attitude => "attitude_samples",
            TableKind::Monitoring => "monitoring_samples",
        }
    }
}

impl std::fmt::Display for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table_name())
    }
}

/// Source-specific metadata carried alongside a sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleMeta {
    /// Register address the value was decoded from (polling sources).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub register: Option<u16>,
    /// Physical sensor location (monitoring sources).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Unit of measurement as reported by the source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl SampleMeta {
    pub fn is_empty(&self) -> bool {
        self.register.is_none() && self.location.is_none() && self.unit.is_none()
    }
}

/// One timestamped value for one tag.
///
/// Created by a collector, transformed by the quality pipeline, batched by
/// the buffer writer and persisted by the store. Immutable after the
/// pipeline finishes with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Identifier of the producing source (e.g. "plc_main").
    pub source_id: String,
    /// Tag / channel name (e.g. "thrust_total").
    pub tag: String,
    /// Epoch milliseconds. Monotonic non-decreasing per (source, tag).
    pub timestamp_ms: i64,
    /// Current value. After calibration this is the corrected reading.
    pub value: f64,
    /// Raw reading before calibration, when a calibration was applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_value: Option<f64>,
    /// Pipeline verdict.
    pub quality: QualityFlag,
    /// Ring number the machine was constructing when the value was read,
    /// when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ring_number: Option<i64>,
    /// Source-specific metadata.
    #[serde(default, skip_serializing_if = "SampleMeta::is_empty")]
    pub meta: SampleMeta,
}

impl Sample {
    /// A freshly collected, not-yet-validated sample.
    pub fn raw(source_id: &str, tag: &str, timestamp_ms: i64, value: f64) -> Self {
        Self {
            source_id: source_id.to_string(),
            tag: tag.to_string(),
            timestamp_ms,
            value,
            original_value: None,
            quality: QualityFlag::Good,
            ring_number: None,
            meta: SampleMeta::default(),
        }
    }

    pub fn with_register(mut self, register: u16) -> Self {
        self.meta.register = Some(register);
        self
    }

    pub fn with_location(mut self, location: &str) -> Self {
        self.meta.location = Some(location.to_string());
        self
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.meta.unit = Some(unit.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_roundtrip() {
        for flag in [
            QualityFlag::Good,
            QualityFlag::Interpolated,
            QualityFlag::OutOfRange,
            QualityFlag::PhysicallyImplausible,
            QualityFlag::CalibratedFromRaw,
            QualityFlag::Missing,
        ] {
            assert_eq!(QualityFlag::parse(flag.as_str()), Some(flag));
        }
        assert_eq!(QualityFlag::parse("bogus"), None);
    }

    #[test]
    fn test_aggregate_eligibility() {
        assert!(QualityFlag::Good.counts_in_aggregates());
        assert!(QualityFlag::Interpolated.counts_in_aggregates());
        assert!(QualityFlag::CalibratedFromRaw.counts_in_aggregates());
        assert!(!QualityFlag::OutOfRange.counts_in_aggregates());
        assert!(!QualityFlag::PhysicallyImplausible.counts_in_aggregates());
        assert!(!QualityFlag::Missing.counts_in_aggregates());
    }

    #[test]
    fn test_sample_builder() {
        let s = Sample::raw("plc_main", "thrust_total", 1_000, 10_250.0)
            .with_register(40_001)
            .with_unit("kN");
        assert_eq!(s.meta.register, Some(40_001));
        assert_eq!(s.meta.unit.as_deref(), Some("kN"));
        assert_eq!(s.quality, QualityFlag::Good);
        assert!(s.original_value.is_none());
    }

    #[test]
    fn test_sample_serde_skips_empty_meta() {
        let s = Sample::raw("plc_main", "thrust_total", 1_000, 1.0);
        let json = serde_json::to_string(&s).unwrap();
        assert!(!json.contains("meta"));
        assert!(!json.contains("original_value"));
        let back: Sample = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
