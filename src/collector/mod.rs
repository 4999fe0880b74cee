//! Source Collectors
//!
//! One collector per configured data source, each a closed variant of
//! subscription / polling / pull-API — a match on the variant selects the
//! run loop. All variants share:
//!
//! - a uniform `start()` / `stop()` / `health()` surface
//! - reconnection with exponential, jittered backoff
//! - fail-fast at `start()` for configuration and auth errors
//! - the source's own quality-pipeline instance, run on the collector task
//!
//! Protocol client libraries are external collaborators; the collectors
//! consume them through the [`SubscriptionClient`] and [`RegisterClient`]
//! traits (open/close, subscribe or read — nothing more). The pull-API
//! variant speaks HTTP directly.

mod backoff;
mod polling;
mod pull_api;
mod subscription;

pub use backoff::Backoff;
pub use polling::decode_register;
pub use pull_api::extract_json_path;
pub use subscription::SubscriptionSink;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aligner::RingTracker;
use crate::config::{ConfigHandle, SourceKind, SourceSpec};
use crate::pipeline::{QualityMetrics, SourcePipeline, Stage};
use crate::types::{CollectorHealth, QualityFlag, Sample, TableKind};

/// Collector failures, split by how they are handled.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    /// Bad endpoint, unknown tag, missing credential env var. Fails fast
    /// at `start()`; never retried.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Network hiccup, protocol timeout. Retried with backoff.
    #[error("transient error: {0}")]
    Transient(String),
    /// Source closed the connection.
    #[error("connection closed")]
    Closed,
}

// ============================================================================
// Protocol client traits (implemented by out-of-scope adapter bindings)
// ============================================================================

/// Client for subscription-driven sources: the server pushes value changes
/// through a callback.
#[async_trait]
pub trait SubscriptionClient: Send + 'static {
    async fn connect(&mut self) -> Result<(), CollectorError>;
    async fn close(&mut self);
    /// Register `tags` with the pushed-change sink, then resolve with the
    /// error that ended the subscription. The sink never blocks, so the
    /// library may call it from its own callback threads.
    async fn run_subscription(&mut self, tags: &[String], sink: SubscriptionSink) -> CollectorError;
}

/// Client for polling sources speaking a binary register protocol.
#[async_trait]
pub trait RegisterClient: Send + 'static {
    async fn connect(&mut self) -> Result<(), CollectorError>;
    async fn close(&mut self);
    /// Read `count` 16-bit registers from the configured block.
    async fn read_block(&mut self, count: u16) -> Result<Vec<u16>, CollectorError>;
}

// ============================================================================
// Health
// ============================================================================

/// Trailing window for the error rate.
const ERROR_WINDOW_MS: i64 = 60_000;

/// Shared connection/health state for one collector.
#[derive(Debug)]
pub struct SourceHealthState {
    source_id: String,
    connected: AtomicBool,
    last_sample_ms: AtomicI64,
    error_times: Mutex<VecDeque<i64>>,
}

impl SourceHealthState {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            connected: AtomicBool::new(false),
            last_sample_ms: AtomicI64::new(0),
            error_times: Mutex::new(VecDeque::new()),
        }
    }

    pub fn mark_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn mark_sample(&self, timestamp_ms: i64) {
        self.last_sample_ms.store(timestamp_ms, Ordering::Relaxed);
    }

    pub fn mark_error(&self, now_ms: i64) {
        let mut errors = self.error_times.lock().expect("health mutex");
        errors.push_back(now_ms);
        while let Some(&front) = errors.front() {
            if now_ms - front > ERROR_WINDOW_MS {
                errors.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn snapshot(&self, now_ms: i64) -> CollectorHealth {
        let count = {
            let errors = self.error_times.lock().expect("health mutex");
            errors.iter().filter(|&&t| now_ms - t <= ERROR_WINDOW_MS).count()
        };
        let last = self.last_sample_ms.load(Ordering::Relaxed);
        CollectorHealth {
            source_id: self.source_id.clone(),
            connected: self.connected.load(Ordering::Relaxed),
            last_sample_ts: (last > 0).then_some(last),
            error_rate_last_60s: count as f64 / (ERROR_WINDOW_MS as f64 / 1_000.0),
        }
    }
}

// ============================================================================
// Collector context — shared per-record path of every run loop
// ============================================================================

/// Owns the source's pipeline instance and the route to its buffer worker.
pub struct CollectorContext {
    table: TableKind,
    pipeline: SourcePipeline,
    output: mpsc::Sender<Sample>,
    ring: Arc<RingTracker>,
    ring_tag: String,
    health: Arc<SourceHealthState>,
}

impl CollectorContext {
    pub fn new(
        spec: &SourceSpec,
        config: ConfigHandle,
        output: mpsc::Sender<Sample>,
        ring: Arc<RingTracker>,
        health: Arc<SourceHealthState>,
    ) -> Self {
        let cadence = spec
            .tags
            .iter()
            .filter_map(|t| t.cadence_hint_ms.map(|c| (t.name.clone(), c)))
            .collect();
        let ring_tag = config.load().aligner.tags.ring_number.clone();
        let pipeline = SourcePipeline::new(
            config,
            Arc::new(QualityMetrics::new()),
            cadence,
            spec.default_cadence_ms,
        );
        Self {
            table: spec.table,
            pipeline,
            output,
            ring,
            ring_tag,
            health,
        }
    }

    /// Run one raw sample through the pipeline and forward the results.
    /// Blocks (backpressure) when the table queue is full.
    pub async fn ingest(&mut self, sample: Sample) {
        if self.table == TableKind::Plc && sample.tag == self.ring_tag {
            self.ring.observe(sample.value);
        }
        let mut sample = sample;
        sample.ring_number = self.ring.current();
        self.health.mark_sample(sample.timestamp_ms);

        for record in self.pipeline.process(sample) {
            if self.output.send(record).await.is_err() {
                tracing::warn!(table = %self.table, "Buffer channel closed, record lost");
                return;
            }
        }
    }

    /// Emit held-value imputations whose look-ahead window expired.
    pub async fn housekeeping(&mut self, now_ms: i64) {
        for record in self.pipeline.poll_expired(now_ms) {
            if self.output.send(record).await.is_err() {
                return;
            }
        }
    }

    /// Account a failed tag read. Nothing is enqueued — Missing records
    /// never reach the store.
    pub fn note_missing(&self, tag: &str) {
        self.pipeline
            .metrics()
            .record(tag, QualityFlag::Missing, Stage::None, 0);
    }

    pub fn metrics(&self) -> Arc<QualityMetrics> {
        self.pipeline.metrics().clone()
    }
}

// ============================================================================
// Collector facade
// ============================================================================

enum Variant {
    Subscription(Option<Box<dyn SubscriptionClient>>),
    Polling(Option<Box<dyn RegisterClient>>),
    PullApi,
}

/// One configured source with its uniform start/stop/health surface.
pub struct Collector {
    spec: SourceSpec,
    config: ConfigHandle,
    output: mpsc::Sender<Sample>,
    ring: Arc<RingTracker>,
    variant: Variant,
    health: Arc<SourceHealthState>,
    metrics: Option<Arc<QualityMetrics>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Collector {
    pub fn subscription(
        spec: SourceSpec,
        config: ConfigHandle,
        output: mpsc::Sender<Sample>,
        ring: Arc<RingTracker>,
        client: Box<dyn SubscriptionClient>,
    ) -> Self {
        Self::new(spec, config, output, ring, Variant::Subscription(Some(client)))
    }

    pub fn polling(
        spec: SourceSpec,
        config: ConfigHandle,
        output: mpsc::Sender<Sample>,
        ring: Arc<RingTracker>,
        client: Box<dyn RegisterClient>,
    ) -> Self {
        Self::new(spec, config, output, ring, Variant::Polling(Some(client)))
    }

    pub fn pull_api(
        spec: SourceSpec,
        config: ConfigHandle,
        output: mpsc::Sender<Sample>,
        ring: Arc<RingTracker>,
    ) -> Self {
        Self::new(spec, config, output, ring, Variant::PullApi)
    }

    fn new(
        spec: SourceSpec,
        config: ConfigHandle,
        output: mpsc::Sender<Sample>,
        ring: Arc<RingTracker>,
        variant: Variant,
    ) -> Self {
        let health = Arc::new(SourceHealthState::new(&spec.source_id));
        Self {
            spec,
            config,
            output,
            ring,
            variant,
            health,
            metrics: None,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.spec.source_id
    }

    /// Begin producing samples. Idempotent; configuration and auth
    /// problems surface here instead of entering the run loop.
    pub fn start(&mut self) -> Result<(), CollectorError> {
        if self.task.is_some() {
            return Ok(());
        }
        if self.spec.endpoint.is_empty() {
            return Err(CollectorError::Configuration(format!(
                "source {} has an empty endpoint",
                self.spec.source_id
            )));
        }

        let ctx = CollectorContext::new(
            &self.spec,
            self.config.clone(),
            self.output.clone(),
            self.ring.clone(),
            self.health.clone(),
        );
        self.metrics = Some(ctx.metrics());
        let cancel = self.cancel.clone();
        let health = self.health.clone();
        let spec = self.spec.clone();

        let task = match &mut self.variant {
            Variant::Subscription(client) => {
                if spec.tags.is_empty() {
                    return Err(CollectorError::Configuration(format!(
                        "subscription source {} has no tags",
                        spec.source_id
                    )));
                }
                let client = client.take().ok_or_else(|| {
                    CollectorError::Configuration("collector already consumed its client".into())
                })?;
                let queue_capacity = self.config.load().channels.source_queue;
                tokio::spawn(subscription::run(
                    spec,
                    queue_capacity,
                    client,
                    ctx,
                    health,
                    cancel,
                ))
            }
            Variant::Polling(client) => {
                let client = client.take().ok_or_else(|| {
                    CollectorError::Configuration("collector already consumed its client".into())
                })?;
                tokio::spawn(polling::run(spec, client, ctx, health, cancel))
            }
            Variant::PullApi => {
                // Credential env vars resolve now — a missing token is a
                // startup failure, not a run-loop retry.
                let prepared = pull_api::prepare(&spec)?;
                tokio::spawn(pull_api::run(spec, prepared, ctx, health, cancel))
            }
        };
        self.task = Some(task);
        tracing::info!(source = %self.spec.source_id, "Collector started");
        Ok(())
    }

    /// Graceful stop: signal cancellation, wait for in-flight reads up to
    /// `deadline`, then abort.
    pub async fn stop(&mut self, deadline: Duration) {
        self.cancel.cancel();
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(deadline, &mut task).await {
                Ok(_) => tracing::info!(source = %self.spec.source_id, "Collector stopped"),
                Err(_) => {
                    task.abort();
                    tracing::warn!(
                        source = %self.spec.source_id,
                        "Collector did not stop within deadline, aborted"
                    );
                }
            }
        }
        self.health.mark_connected(false);
    }

    pub fn health(&self) -> CollectorHealth {
        self.health.snapshot(crate::types::now_ms())
    }

    /// Shared health state, for the merged `api::health()` surface.
    pub fn health_state(&self) -> Arc<SourceHealthState> {
        self.health.clone()
    }

    /// Quality counters of this source's pipeline, once started.
    pub fn quality_metrics(&self) -> Option<Arc<QualityMetrics>> {
        self.metrics.clone()
    }
}

/// Build a collector for `spec`, choosing the run loop by variant.
/// Subscription and polling sources need their protocol client supplied by
/// the adapter layer.
pub fn build(
    spec: SourceSpec,
    config: ConfigHandle,
    output: mpsc::Sender<Sample>,
    ring: Arc<RingTracker>,
    subscription_client: Option<Box<dyn SubscriptionClient>>,
    register_client: Option<Box<dyn RegisterClient>>,
) -> Result<Collector, CollectorError> {
    match &spec.kind {
        SourceKind::Subscription => {
            let client = subscription_client.ok_or_else(|| {
                CollectorError::Configuration(format!(
                    "subscription source {} needs a protocol client",
                    spec.source_id
                ))
            })?;
            Ok(Collector::subscription(spec, config, output, ring, client))
        }
        SourceKind::Polling { .. } => {
            let client = register_client.ok_or_else(|| {
                CollectorError::Configuration(format!(
                    "polling source {} needs a protocol client",
                    spec.source_id
                ))
            })?;
            Ok(Collector::polling(spec, config, output, ring, client))
        }
        SourceKind::PullApi { .. } => Ok(Collector::pull_api(spec, config, output, ring)),
    }
}
