//! Buffer Writer — bounded batching between the pipeline and the store
//!
//! One worker per destination table, each owning its FIFO exclusively.
//! A flush happens when any of these fire:
//!
//! - the FIFO reaches `flush_threshold`
//! - `flush_interval` elapses since the last flush
//! - shutdown is requested (best-effort drain within the grace period)
//!
//! Flushes are serial per table by construction (one worker, one loop).
//! A failed flush is retried once after 100 ms; a second failure moves the
//! batch to the poison sidecar and the worker continues with fresh data.

pub mod poison;

pub use poison::{read_batches, PoisonBatch};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigHandle, OverflowPolicy};
use crate::storage::EdgeStore;
use crate::types::{BufferHealth, Sample, TableKind};

/// Delay before the single flush retry.
const FLUSH_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Minimum spacing between repeated fatal-storage log lines.
const FATAL_LOG_INTERVAL_MS: i64 = 60_000;

/// Shared counters for one table's buffer worker.
#[derive(Debug, Default)]
pub struct BufferStats {
    received: AtomicU64,
    written: AtomicU64,
    overflow_dropped_oldest: AtomicU64,
    overflow_dropped_newest: AtomicU64,
    flushes: AtomicU64,
    poisoned_batches: AtomicU64,
    depth: AtomicUsize,
    last_flush_ms: AtomicI64,
}

impl BufferStats {
    pub fn snapshot(&self, table: TableKind) -> BufferHealth {
        let last = self.last_flush_ms.load(Ordering::Relaxed);
        BufferHealth {
            table: table.table_name().to_string(),
            depth: self.depth.load(Ordering::Relaxed),
            last_flush_ts: (last > 0).then_some(last),
            poisoned_batches: self.poisoned_batches.load(Ordering::Relaxed),
        }
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn dropped_oldest(&self) -> u64 {
        self.overflow_dropped_oldest.load(Ordering::Relaxed)
    }

    pub fn dropped_newest(&self) -> u64 {
        self.overflow_dropped_newest.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn poisoned_batches(&self) -> u64 {
        self.poisoned_batches.load(Ordering::Relaxed)
    }
}

/// Worker that owns one table's FIFO and write path.
pub struct BufferWriter {
    table: TableKind,
    store: Arc<EdgeStore>,
    config: ConfigHandle,
    rx: mpsc::Receiver<Sample>,
    cancel: CancellationToken,
    fifo: VecDeque<Sample>,
    stats: Arc<BufferStats>,
    last_fatal_log_ms: i64,
}

impl BufferWriter {
    pub fn new(
        table: TableKind,
        store: Arc<EdgeStore>,
        config: ConfigHandle,
        rx: mpsc::Receiver<Sample>,
        cancel: CancellationToken,
    ) -> (Self, Arc<BufferStats>) {
        let stats = Arc::new(BufferStats::default());
        (
            Self {
                table,
                store,
                config,
                rx,
                cancel,
                fifo: VecDeque::new(),
                stats: stats.clone(),
                last_fatal_log_ms: 0,
            },
            stats,
        )
    }

    /// Run until cancellation or channel close, then drain.
    pub async fn run(mut self) {
        let flush_interval =
            Duration::from_millis(self.config.load().buffer.flush_interval_ms.max(1));
        let mut tick = tokio::time::interval(flush_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(table = %self.table, "Buffer writer started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {
                    if !self.fifo.is_empty() {
                        self.flush().await;
                    }
                }
                received = self.rx.recv() => {
                    match received {
                        Some(sample) => {
                            self.append(sample).await;
                            let threshold = self.config.load().buffer.flush_threshold;
                            if self.fifo.len() >= threshold {
                                self.flush().await;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        self.shutdown_drain().await;
    }

    /// Append one record, applying the overflow policy at `max_size`.
    async fn append(&mut self, sample: Sample) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let cfg = self.config.load();

        if self.fifo.len() >= cfg.buffer.max_size {
            match cfg.buffer.overflow_policy {
                OverflowPolicy::DropOldest => {
                    self.fifo.pop_front();
                    self.stats
                        .overflow_dropped_oldest
                        .fetch_add(1, Ordering::Relaxed);
                }
                OverflowPolicy::DropNewest => {
                    self.stats
                        .overflow_dropped_newest
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats.depth.store(self.fifo.len(), Ordering::Relaxed);
                    return;
                }
                OverflowPolicy::Block => {
                    // Flushing in-line frees space; channel backpressure
                    // stalls producers in the meantime.
                    self.flush().await;
                }
            }
        }

        self.fifo.push_back(sample);
        self.stats.depth.store(self.fifo.len(), Ordering::Relaxed);
    }

    /// Flush the whole FIFO in one transaction, retrying once, poisoning on
    /// the second failure.
    async fn flush(&mut self) {
        if self.fifo.is_empty() {
            return;
        }
        if self.store.is_fatal() {
            // Writers stop on fatal storage; the FIFO keeps absorbing under
            // its overflow policy so the process stays inspectable.
            let now = crate::types::now_ms();
            if now - self.last_fatal_log_ms >= FATAL_LOG_INTERVAL_MS {
                self.last_fatal_log_ms = now;
                tracing::error!(
                    table = %self.table,
                    depth = self.fifo.len(),
                    "Storage fatal — buffering without flushing"
                );
            }
            return;
        }

        let batch: Vec<Sample> = self.fifo.drain(..).collect();
        self.stats.depth.store(0, Ordering::Relaxed);

        match self.store.insert_samples(self.table, &batch) {
            Ok(n) => self.record_flush(n),
            Err(first) => {
                tracing::warn!(
                    table = %self.table,
                    error = %first,
                    records = batch.len(),
                    "Flush failed, retrying once"
                );
                tokio::time::sleep(FLUSH_RETRY_DELAY).await;
                match self.store.insert_samples(self.table, &batch) {
                    Ok(n) => self.record_flush(n),
                    Err(second) => {
                        tracing::error!(
                            table = %self.table,
                            error = %second,
                            records = batch.len(),
                            "Flush failed twice, poisoning batch"
                        );
                        self.poison(&batch);
                    }
                }
            }
        }
    }

    fn record_flush(&self, written: usize) {
        self.stats.written.fetch_add(written as u64, Ordering::Relaxed);
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .last_flush_ms
            .store(crate::types::now_ms(), Ordering::Relaxed);
        tracing::debug!(table = %self.table, records = written, "Flushed batch");
    }

    fn poison(&self, batch: &[Sample]) {
        let dir = self.config.load().buffer.poison_dir.clone();
        match poison::append_batch(&dir, self.table, batch, crate::types::now_ms()) {
            Ok(_) => {
                self.stats.poisoned_batches.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // Nothing left to try — the records are lost and said so.
                tracing::error!(
                    table = %self.table,
                    error = %e,
                    records = batch.len(),
                    "Failed to write poison batch, records lost"
                );
            }
        }
    }

    /// Shutdown path: pull whatever is still queued, then flush within the
    /// grace period; leftovers are poisoned.
    async fn shutdown_drain(&mut self) {
        while let Ok(sample) = self.rx.try_recv() {
            self.append(sample).await;
        }
        if self.fifo.is_empty() {
            tracing::info!(table = %self.table, "Buffer writer stopped (empty)");
            return;
        }

        let grace = Duration::from_millis(self.config.load().buffer.shutdown_grace_ms);
        let remaining = self.fifo.len();
        tracing::info!(
            table = %self.table,
            records = remaining,
            grace_ms = grace.as_millis() as u64,
            "Draining buffer on shutdown"
        );

        // The flush itself is bounded (two insert attempts, one short
        // retry pause), so it must not be cancelled mid-transaction —
        // cancellation after the FIFO is drained would lose the batch.
        let started = std::time::Instant::now();
        self.flush().await;
        if started.elapsed() > grace {
            tracing::warn!(table = %self.table, "Shutdown drain exceeded grace period");
        }
        if !self.fifo.is_empty() {
            let batch: Vec<Sample> = self.fifo.drain(..).collect();
            self.poison(&batch);
        }
        self.stats.depth.store(0, Ordering::Relaxed);
        tracing::info!(table = %self.table, "Buffer writer stopped");
    }
}
