//! Edge pipeline configuration — value structs only
//!
//! The core never parses text configuration; the out-of-scope config layer
//! deserializes its files into these structs and hands them over. Every
//! struct implements `Default` with the documented default values so a bare
//! `EdgeConfig::default()` is a runnable (if source-less) configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::TableKind;

// ============================================================================
// Sources
// ============================================================================

/// Register value encoding for polling sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterType {
    /// 32-bit IEEE float, two registers, high word first.
    Float32Be,
    /// 32-bit IEEE float, two registers, low word first.
    Float32Le,
    Uint16,
    Int16,
    /// 32-bit signed integer, two registers, high word first.
    Int32Be,
}

impl RegisterType {
    /// Number of 16-bit registers this type occupies.
    pub fn register_count(self) -> usize {
        match self {
            RegisterType::Uint16 | RegisterType::Int16 => 1,
            RegisterType::Float32Be | RegisterType::Float32Le | RegisterType::Int32Be => 2,
        }
    }
}

/// Location of one tag inside a polled register block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegisterSpec {
    /// Address of the first register, relative to the block start.
    pub address: u16,
    pub kind: RegisterType,
}

/// One channel of a data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagSpec {
    pub name: String,
    #[serde(default)]
    pub unit: Option<String>,
    /// Register layout — required for polling sources, unused otherwise.
    #[serde(default)]
    pub register: Option<RegisterSpec>,
    /// Expected sample interval, used for gap detection.
    #[serde(default)]
    pub cadence_hint_ms: Option<i64>,
}

impl TagSpec {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            unit: None,
            register: None,
            cadence_hint_ms: None,
        }
    }
}

/// Reconnection backoff bounds. Jitter of ±20 % is applied on top.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub min_ms: u64,
    pub max_ms: u64,
    /// Relative jitter, applied symmetrically (0.2 = ±20 %).
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_ms: 1_000,
            max_ms: 60_000,
            jitter: 0.2,
        }
    }
}

/// Authentication mode for pull-API sources. Secrets are never stored in
/// config — only the names of environment variables holding them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum PullAuth {
    None,
    Bearer { token_env: String },
    Basic { username: String, password_env: String },
}

impl Default for PullAuth {
    fn default() -> Self {
        PullAuth::None
    }
}

/// Mapping of one JSON response field to a tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonField {
    /// Dotted path into the response body (e.g. "data.settlement.value").
    pub path: String,
    /// Tag name the extracted value is published under.
    pub tag: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
}

/// One HTTP endpoint polled by a pull-API source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullEndpoint {
    pub name: String,
    pub url: String,
    /// Poll interval in seconds (monitoring data arrives slowly).
    pub poll_interval_s: u64,
    pub fields: Vec<JsonField>,
}

/// Collector variant. Closed set — a match on this selects the run loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SourceKind {
    /// Server pushes value changes through a callback.
    Subscription,
    /// Client reads a block of registers at a fixed interval.
    Polling {
        poll_interval_ms: u64,
        /// Number of 16-bit registers in the polled block.
        block_size: u16,
    },
    /// Periodic HTTP fetch of JSON documents.
    PullApi {
        #[serde(default)]
        auth: PullAuth,
        endpoints: Vec<PullEndpoint>,
    },
}

/// Configuration of one data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Stable identifier, unique across sources (e.g. "plc_main").
    pub source_id: String,
    /// Destination table for samples from this source.
    pub table: TableKind,
    pub kind: SourceKind,
    /// Protocol endpoint address (server URL, host:port, or API base URL).
    pub endpoint: String,
    pub tags: Vec<TagSpec>,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Expected interval between samples when a tag carries no hint.
    #[serde(default = "default_cadence_ms")]
    pub default_cadence_ms: i64,
}

fn default_cadence_ms() -> i64 {
    1_000
}

// ============================================================================
// Quality pipeline
// ============================================================================

/// Engineering envelope for one tag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TagThreshold {
    pub min: f64,
    pub max: f64,
    /// Advisory band — values beyond these are reported but not rejected.
    #[serde(default)]
    pub warn_low: Option<f64>,
    #[serde(default)]
    pub warn_high: Option<f64>,
}

/// Linear calibration: `corrected = offset + scale × raw`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub offset: f64,
    pub scale: f64,
}

/// Comparison used by cross-tag reasonableness rules.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op", content = "value")]
pub enum Predicate {
    GreaterThan(f64),
    LessThan(f64),
}

impl Predicate {
    pub fn holds(&self, v: f64) -> bool {
        match *self {
            Predicate::GreaterThan(x) => v > x,
            Predicate::LessThan(x) => v < x,
        }
    }
}

/// Cross-tag constraint: whenever `when` holds for `when_tag`'s latest
/// value, `require` must hold for `require_tag`'s latest value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossTagRule {
    pub name: String,
    pub when_tag: String,
    pub when: Predicate,
    pub require_tag: String,
    pub require: Predicate,
}

/// Physical reasonableness rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasonablenessConfig {
    /// Per-tag bound on |Δvalue/Δt| in units per second.
    #[serde(default)]
    pub max_rate: HashMap<String, f64>,
    #[serde(default)]
    pub cross_rules: Vec<CrossTagRule>,
}

/// Interpolation and rolling-history tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Largest gap that is still imputed. Exactly-at-limit interpolates;
    /// one millisecond over drops.
    pub gap_max_ms: i64,
    /// Good samples retained per tag for interpolation and rate checks.
    pub history_len: usize,
    /// Rolling history horizon per tag.
    pub history_window_ms: i64,
    /// Slack added to the cadence hint before a late sample counts as a gap.
    pub cadence_tolerance_ms: i64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            gap_max_ms: 10_000,
            history_len: 8,
            history_window_ms: 30_000,
            cadence_tolerance_ms: 500,
        }
    }
}

// ============================================================================
// Buffer writer
// ============================================================================

/// What to do when a buffer FIFO is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    DropOldest,
    DropNewest,
    /// Appender waits for space. Debugging only.
    Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Hard cap on records held per destination table.
    pub max_size: usize,
    /// FIFO length that triggers an early flush.
    pub flush_threshold: usize,
    pub flush_interval_ms: u64,
    pub overflow_policy: OverflowPolicy,
    /// Shutdown drain budget before remaining records are poisoned.
    pub shutdown_grace_ms: u64,
    /// Directory for poison batch files.
    pub poison_dir: std::path::PathBuf,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            flush_threshold: 1_000,
            flush_interval_ms: 5_000,
            overflow_policy: OverflowPolicy::DropOldest,
            shutdown_grace_ms: 30_000,
            poison_dir: std::path::PathBuf::from("poison"),
        }
    }
}

// ============================================================================
// Ring aligner
// ============================================================================

/// Tag names the aligner reads from the PLC / attitude / monitoring tables.
/// Defaults match the standard shield telemetry vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignerTags {
    pub ring_number: String,
    pub thrust: String,
    pub torque: String,
    pub chamber_pressure: String,
    pub advance_rate: String,
    pub grout_pressure: String,
    pub grout_volume: String,
    pub cutterhead_speed: String,
    pub pitch: String,
    pub roll: String,
    pub yaw: String,
    pub horizontal_deviation: String,
    pub vertical_deviation: String,
    pub settlement: String,
    pub displacement: String,
    pub groundwater: String,
}

impl Default for AlignerTags {
    fn default() -> Self {
        Self {
            ring_number: "ring_number".to_string(),
            thrust: "thrust_total".to_string(),
            torque: "cutterhead_torque".to_string(),
            chamber_pressure: "chamber_pressure".to_string(),
            advance_rate: "advance_rate".to_string(),
            grout_pressure: "grout_pressure".to_string(),
            grout_volume: "grout_volume".to_string(),
            cutterhead_speed: "cutterhead_speed".to_string(),
            pitch: "pitch".to_string(),
            roll: "roll".to_string(),
            yaw: "yaw".to_string(),
            horizontal_deviation: "horizontal_deviation".to_string(),
            vertical_deviation: "vertical_deviation".to_string(),
            settlement: "settlement_value".to_string(),
            displacement: "displacement_value".to_string(),
            groundwater: "groundwater_level".to_string(),
        }
    }
}

/// A labelled geological zone covering a ring-number range (inclusive).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoZone {
    pub from_ring: i64,
    pub to_ring: i64,
    pub label: String,
}

/// Ring geometry constants used by the derived indicators.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RingGeometry {
    /// Excavation diameter (m).
    pub tunnel_diameter_m: f64,
    /// Advance per ring (m).
    pub ring_width_m: f64,
    /// Theoretical annular tail void per ring (m³). When absent it is
    /// estimated from the geometry.
    #[serde(default)]
    pub tail_void_volume_m3: Option<f64>,
}

impl Default for RingGeometry {
    fn default() -> Self {
        Self {
            tunnel_diameter_m: 6.2,
            ring_width_m: 1.5,
            tail_void_volume_m3: None,
        }
    }
}

impl RingGeometry {
    /// Excavation face area (m²).
    pub fn cross_section_area_m2(&self) -> f64 {
        let r = self.tunnel_diameter_m / 2.0;
        std::f64::consts::PI * r * r
    }

    /// Theoretical excavated volume per ring (m³).
    pub fn excavation_volume_m3(&self) -> f64 {
        self.cross_section_area_m2() * self.ring_width_m
    }

    /// Tail void volume (m³) — configured value, or the ~50 mm overcut
    /// estimate when not configured.
    pub fn tail_void_m3(&self) -> f64 {
        if let Some(v) = self.tail_void_volume_m3 {
            return v;
        }
        let overcut_r = (self.tunnel_diameter_m + 0.1) / 2.0;
        let shield_r = (self.tunnel_diameter_m - 0.05) / 2.0;
        let annulus = std::f64::consts::PI * (overcut_r * overcut_r - shield_r * shield_r);
        annulus * self.ring_width_m
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignerConfig {
    pub tick_interval_s: u64,
    /// Settlement association window after ring start: [start, start + lag).
    pub settlement_lag_window_s: i64,
    /// Window after first summary write during which late monitoring data
    /// may update the row once.
    pub grace_window_s: i64,
    /// Rings older than this are finalized as-is and not retried.
    pub max_ring_age_s: i64,
    #[serde(default)]
    pub tags: AlignerTags,
    #[serde(default)]
    pub geometry: RingGeometry,
    #[serde(default)]
    pub zones: Vec<GeoZone>,
}

impl Default for AlignerConfig {
    fn default() -> Self {
        Self {
            tick_interval_s: 300,
            settlement_lag_window_s: 7_200,
            grace_window_s: 28_800,
            max_ring_age_s: 86_400,
            tags: AlignerTags::default(),
            geometry: RingGeometry::default(),
            zones: Vec::new(),
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// Row retention per sample table, in days. `None` keeps forever.
/// Ring summaries are never deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub plc_days: Option<u32>,
    pub attitude_days: Option<u32>,
    pub monitoring_days: Option<u32>,
}

impl RetentionConfig {
    pub fn days_for(&self, table: TableKind) -> Option<u32> {
        match table {
            TableKind::Plc => self.plc_days,
            TableKind::Attitude => self.attitude_days,
            TableKind::Monitoring => self.monitoring_days,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: std::path::PathBuf,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: std::path::PathBuf::from("data/edge.db"),
            retention: RetentionConfig::default(),
        }
    }
}

// ============================================================================
// Channels
// ============================================================================

/// Bounded queue capacities between pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Collector → pipeline queue, per source.
    pub source_queue: usize,
    /// Pipeline → buffer-writer queue, per destination table.
    pub table_queue: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            source_queue: 1_024,
            table_queue: 4_096,
        }
    }
}

// ============================================================================
// Shutdown
// ============================================================================

/// Per-phase timeouts for cooperative shutdown. Overrunning a phase logs a
/// warning; nothing panics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Budget for collectors to finish in-flight reads.
    pub collector_deadline_ms: u64,
    /// Budget for the aligner to finish its current ring.
    pub aligner_deadline_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            collector_deadline_ms: 5_000,
            aligner_deadline_ms: 10_000,
        }
    }
}

// ============================================================================
// Top level
// ============================================================================

/// Root configuration handed to `EdgeRuntime::start`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeConfig {
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
    /// Per-tag engineering envelopes.
    #[serde(default)]
    pub thresholds: HashMap<String, TagThreshold>,
    /// Per-tag linear calibrations.
    #[serde(default)]
    pub calibration: HashMap<String, Calibration>,
    #[serde(default)]
    pub reasonableness: ReasonablenessConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub aligner: AlignerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub channels: ChannelConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl EdgeConfig {
    /// Geological zone label for a ring number, if one is configured.
    pub fn zone_for_ring(&self, ring_number: i64) -> Option<&str> {
        self.aligner
            .zones
            .iter()
            .find(|z| ring_number >= z.from_ring && ring_number <= z.to_ring)
            .map(|z| z.label.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = EdgeConfig::default();
        assert_eq!(cfg.buffer.max_size, 10_000);
        assert_eq!(cfg.buffer.flush_threshold, 1_000);
        assert_eq!(cfg.buffer.flush_interval_ms, 5_000);
        assert_eq!(cfg.buffer.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(cfg.quality.gap_max_ms, 10_000);
        assert_eq!(cfg.quality.history_len, 8);
        assert_eq!(cfg.aligner.tick_interval_s, 300);
        assert_eq!(cfg.aligner.max_ring_age_s, 86_400);
        assert_eq!(cfg.store.path, std::path::PathBuf::from("data/edge.db"));
    }

    #[test]
    fn test_ring_geometry_volumes() {
        let geom = RingGeometry::default();
        // π × 3.1² × 1.5 ≈ 45.3 m³
        let vol = geom.excavation_volume_m3();
        assert!((vol - 45.28).abs() < 0.1, "got {vol}");
        assert!(geom.tail_void_m3() > 0.0);
        let fixed = RingGeometry {
            tail_void_volume_m3: Some(2.5),
            ..RingGeometry::default()
        };
        assert_eq!(fixed.tail_void_m3(), 2.5);
    }

    #[test]
    fn test_zone_lookup() {
        let mut cfg = EdgeConfig::default();
        cfg.aligner.zones.push(GeoZone {
            from_ring: 1,
            to_ring: 150,
            label: "soft clay".to_string(),
        });
        cfg.aligner.zones.push(GeoZone {
            from_ring: 151,
            to_ring: 400,
            label: "weathered granite".to_string(),
        });
        assert_eq!(cfg.zone_for_ring(100), Some("soft clay"));
        assert_eq!(cfg.zone_for_ring(151), Some("weathered granite"));
        assert_eq!(cfg.zone_for_ring(500), None);
    }

    #[test]
    fn test_register_counts() {
        assert_eq!(RegisterType::Uint16.register_count(), 1);
        assert_eq!(RegisterType::Float32Be.register_count(), 2);
        assert_eq!(RegisterType::Int32Be.register_count(), 2);
    }

    #[test]
    fn test_predicate() {
        assert!(Predicate::GreaterThan(0.0).holds(1.0));
        assert!(!Predicate::GreaterThan(0.0).holds(0.0));
        assert!(Predicate::LessThan(5.0).holds(4.9));
    }
}
