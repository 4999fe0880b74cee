//! Runtime wiring — channels, workers, ordered shutdown
//!
//! ```text
//! sources → collectors (+ per-source quality pipeline)
//!         → bounded table channels
//!         → buffer writers (one per table)
//!         → store
//! store   → ring aligner → store (summary table)
//! ```
//!
//! Shutdown is cooperative and phased: collectors stop intake and drain
//! their pipelines; buffer writers flush within the grace period; the
//! aligner finishes its current tick. Overrunning a phase logs a warning
//! and moves on — nothing panics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aligner::{RingAligner, RingTracker};
use crate::api::EdgeApi;
use crate::buffer::{BufferStats, BufferWriter};
use crate::collector::{self, Collector, RegisterClient, SubscriptionClient};
use crate::config::{self, ConfigHandle, EdgeConfig};
use crate::storage::EdgeStore;
use crate::types::{Sample, TableKind};

/// Protocol clients supplied by the adapter layer, keyed by source id.
/// Pull-API sources need no entry — they speak HTTP directly.
#[derive(Default)]
pub struct CollectorClients {
    pub subscription: HashMap<String, Box<dyn SubscriptionClient>>,
    pub register: HashMap<String, Box<dyn RegisterClient>>,
}

impl CollectorClients {
    pub fn with_subscription(mut self, source_id: &str, client: Box<dyn SubscriptionClient>) -> Self {
        self.subscription.insert(source_id.to_string(), client);
        self
    }

    pub fn with_register(mut self, source_id: &str, client: Box<dyn RegisterClient>) -> Self {
        self.register.insert(source_id.to_string(), client);
        self
    }
}

/// The assembled pipeline core.
pub struct EdgeRuntime {
    config: ConfigHandle,
    store: Arc<EdgeStore>,
    ring: Arc<RingTracker>,
    collectors: Vec<Collector>,
    buffer_tasks: Vec<JoinHandle<()>>,
    aligner_task: JoinHandle<()>,
    cancel_buffers: CancellationToken,
    cancel_aligner: CancellationToken,
    api: EdgeApi,
}

impl EdgeRuntime {
    /// Validate config, open the store, spawn every worker and start the
    /// collectors. Configuration and auth errors fail here — nothing
    /// half-starts.
    pub async fn start(cfg: EdgeConfig, mut clients: CollectorClients) -> anyhow::Result<Self> {
        config::validate(&cfg).context("configuration rejected")?;
        let store_path = cfg.store.path.clone();
        let config = ConfigHandle::new(cfg);
        let store = Arc::new(
            EdgeStore::open(&store_path)
                .with_context(|| format!("opening store at {}", store_path.display()))?,
        );
        let ring = Arc::new(RingTracker::new());

        let cancel_buffers = CancellationToken::new();
        let cancel_aligner = CancellationToken::new();

        // One bounded channel and one writer per destination table.
        let mut buffer_tx: HashMap<TableKind, mpsc::Sender<Sample>> = HashMap::new();
        let mut buffer_stats: Vec<(TableKind, Arc<BufferStats>)> = Vec::new();
        let mut buffer_tasks = Vec::new();
        let table_queue = config.load().channels.table_queue;
        for table in TableKind::ALL {
            let (tx, rx) = mpsc::channel(table_queue);
            let (writer, stats) = BufferWriter::new(
                table,
                store.clone(),
                config.clone(),
                rx,
                cancel_buffers.clone(),
            );
            buffer_tx.insert(table, tx);
            buffer_stats.push((table, stats));
            buffer_tasks.push(tokio::spawn(writer.run()));
        }

        let mut collectors = Vec::new();
        for spec in config.load().sources.clone() {
            let output = buffer_tx
                .get(&spec.table)
                .expect("writer exists for every table")
                .clone();
            let subscription = clients.subscription.remove(&spec.source_id);
            let register = clients.register.remove(&spec.source_id);
            let mut collector = collector::build(
                spec,
                config.clone(),
                output,
                ring.clone(),
                subscription,
                register,
            )?;
            collector.start()?;
            collectors.push(collector);
        }

        let aligner = Arc::new(RingAligner::new(store.clone(), config.clone()));
        let aligner_task = tokio::spawn(aligner.clone().run(cancel_aligner.clone()));

        let api = EdgeApi::new(
            store.clone(),
            config.clone(),
            collectors.iter().map(Collector::health_state).collect(),
            buffer_stats,
            aligner,
        );

        tracing::info!(
            sources = collectors.len(),
            store = %store.path().display(),
            "Edge runtime started"
        );
        Ok(Self {
            config,
            store,
            ring,
            collectors,
            buffer_tasks,
            aligner_task,
            cancel_buffers,
            cancel_aligner,
            api,
        })
    }

    /// The operation surface consumed by the out-of-scope layers.
    pub fn api(&self) -> EdgeApi {
        self.api.clone()
    }

    pub fn store(&self) -> Arc<EdgeStore> {
        self.store.clone()
    }

    /// Handle for publishing hot-reloaded configuration snapshots.
    pub fn config_handle(&self) -> ConfigHandle {
        self.config.clone()
    }

    pub fn ring_tracker(&self) -> Arc<RingTracker> {
        self.ring.clone()
    }

    /// Cooperative, phased shutdown.
    pub async fn shutdown(mut self) {
        let shutdown = self.config.load().shutdown;
        tracing::info!("Shutdown requested");

        // Phase 1: collectors stop intake, drain in-flight reads.
        for collector in &mut self.collectors {
            collector
                .stop(Duration::from_millis(shutdown.collector_deadline_ms))
                .await;
        }
        // Dropping the collectors releases their channel senders so the
        // writers can observe a closed queue as well as the cancel signal.
        self.collectors.clear();

        // Phase 2: buffer writers flush remaining records (grace period is
        // enforced inside the writer).
        self.cancel_buffers.cancel();
        for task in self.buffer_tasks {
            if task.await.is_err() {
                tracing::warn!("Buffer writer task ended abnormally");
            }
        }

        // Phase 3: aligner finishes its current tick.
        self.cancel_aligner.cancel();
        let deadline = Duration::from_millis(shutdown.aligner_deadline_ms);
        if tokio::time::timeout(deadline, self.aligner_task).await.is_err() {
            tracing::warn!("Aligner did not stop within deadline");
        }

        tracing::info!("Edge runtime stopped");
    }
}
