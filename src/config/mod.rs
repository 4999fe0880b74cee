//! Edge Configuration Module
//!
//! The core consumes already-validated value structs — text parsing belongs
//! to the out-of-scope config layer. What lives here:
//!
//! - [`EdgeConfig`] and its section structs, with documented defaults
//! - [`ConfigHandle`] — a hot-swappable immutable snapshot behind an atomic
//!   pointer. Readers acquire a snapshot once per record and run to
//!   completion against it; a reload publishes a new snapshot without
//!   touching in-flight records.
//! - [`validate`] — fail-fast structural checks run before anything starts.

mod edge_config;

pub use edge_config::*;

use std::sync::Arc;

use arc_swap::ArcSwap;

/// Shared handle to the current configuration snapshot.
///
/// Cloning the handle is cheap; all clones observe the same snapshot.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<EdgeConfig>>,
}

impl ConfigHandle {
    pub fn new(config: EdgeConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    /// Acquire the current snapshot. The returned `Arc` stays valid even if
    /// a reload publishes a newer snapshot while it is held.
    pub fn load(&self) -> Arc<EdgeConfig> {
        self.inner.load_full()
    }

    /// Publish a new snapshot. In-flight records keep the snapshot they
    /// started with.
    pub fn publish(&self, config: EdgeConfig) {
        self.inner.store(Arc::new(config));
        tracing::info!("Configuration snapshot replaced");
    }
}

/// Structural validation, run once before the runtime starts.
///
/// Configuration errors fail fast and never enter a run loop.
pub fn validate(config: &EdgeConfig) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for source in &config.sources {
        if !seen.insert(source.source_id.as_str()) {
            return Err(ConfigError::DuplicateSource(source.source_id.clone()));
        }
        if source.endpoint.is_empty() {
            return Err(ConfigError::EmptyEndpoint(source.source_id.clone()));
        }
        match &source.kind {
            SourceKind::Polling { block_size, .. } => {
                if source.tags.is_empty() {
                    return Err(ConfigError::NoTags(source.source_id.clone()));
                }
                for tag in &source.tags {
                    let Some(reg) = tag.register else {
                        return Err(ConfigError::MissingRegister {
                            source_id: source.source_id.clone(),
                            tag: tag.name.clone(),
                        });
                    };
                    let end = reg.address as usize + reg.kind.register_count();
                    if end > *block_size as usize {
                        return Err(ConfigError::RegisterOutOfBlock {
                            source_id: source.source_id.clone(),
                            tag: tag.name.clone(),
                        });
                    }
                }
            }
            SourceKind::Subscription => {
                if source.tags.is_empty() {
                    return Err(ConfigError::NoTags(source.source_id.clone()));
                }
            }
            SourceKind::PullApi { endpoints, .. } => {
                if endpoints.is_empty() {
                    return Err(ConfigError::NoTags(source.source_id.clone()));
                }
            }
        }
        if source.backoff.min_ms == 0 || source.backoff.max_ms < source.backoff.min_ms {
            return Err(ConfigError::BadBackoff(source.source_id.clone()));
        }
    }

    for (tag, threshold) in &config.thresholds {
        if threshold.min > threshold.max {
            return Err(ConfigError::InvertedThreshold(tag.clone()));
        }
    }
    for (tag, cal) in &config.calibration {
        if cal.scale == 0.0 || !cal.scale.is_finite() || !cal.offset.is_finite() {
            return Err(ConfigError::BadCalibration(tag.clone()));
        }
    }
    if config.buffer.flush_threshold > config.buffer.max_size {
        return Err(ConfigError::BufferThresholdAboveMax);
    }
    Ok(())
}

/// Configuration validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate source id: {0}")]
    DuplicateSource(String),
    #[error("source {0} has an empty endpoint")]
    EmptyEndpoint(String),
    #[error("source {0} has no tags configured")]
    NoTags(String),
    #[error("polling source {source_id}: tag {tag} has no register mapping")]
    MissingRegister { source_id: String, tag: String },
    #[error("polling source {source_id}: tag {tag} register extends past the block")]
    RegisterOutOfBlock { source_id: String, tag: String },
    #[error("source {0}: backoff min must be > 0 and <= max")]
    BadBackoff(String),
    #[error("threshold for {0} has min > max")]
    InvertedThreshold(String),
    #[error("calibration for {0} has a zero or non-finite coefficient")]
    BadCalibration(String),
    #[error("buffer flush_threshold exceeds max_size")]
    BufferThresholdAboveMax,
}
