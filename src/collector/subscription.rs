//! Subscription collector — server pushes value changes
//!
//! The protocol library invokes a callback per change. The callback side is
//! a [`SubscriptionSink`]: its only job is to translate (tag, value,
//! timestamp) into a queued sample, and it never blocks — when the bounded
//! queue is full the oldest entry is discarded and a counter incremented,
//! so a stalled consumer can never stall the server's callback threads.
//! No lock is held across the callback boundary beyond the queue's own
//! short push.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::SourceSpec;
use crate::types::Sample;

use super::{Backoff, CollectorContext, SourceHealthState, SubscriptionClient};

/// Cadence of the housekeeping tick (expired-gap imputation).
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

struct SharedQueue {
    inner: Mutex<VecDeque<Sample>>,
    capacity: usize,
    dropped_oldest: AtomicU64,
    notify: Notify,
}

/// Non-blocking handle handed to the protocol library's callbacks.
#[derive(Clone)]
pub struct SubscriptionSink {
    source_id: Arc<str>,
    queue: Arc<SharedQueue>,
}

impl SubscriptionSink {
    pub fn new(source_id: &str, capacity: usize) -> Self {
        Self {
            source_id: Arc::from(source_id),
            queue: Arc::new(SharedQueue {
                inner: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity: capacity.max(1),
                dropped_oldest: AtomicU64::new(0),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue one pushed change. Never blocks; drops the oldest queued
    /// sample when full.
    pub fn push(&self, tag: &str, value: f64, timestamp_ms: i64) {
        let sample = Sample::raw(&self.source_id, tag, timestamp_ms, value);
        {
            let mut queue = self.queue.inner.lock().expect("subscription queue mutex");
            if queue.len() >= self.queue.capacity {
                queue.pop_front();
                self.queue.dropped_oldest.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(sample);
        }
        self.queue.notify.notify_one();
    }

    /// Pushed changes discarded because the queue was full.
    pub fn dropped_oldest(&self) -> u64 {
        self.queue.dropped_oldest.load(Ordering::Relaxed)
    }

    async fn pop(&self) -> Sample {
        loop {
            if let Some(sample) = self.queue.inner.lock().expect("subscription queue mutex").pop_front() {
                return sample;
            }
            self.queue.notify.notified().await;
        }
    }

    fn try_pop(&self) -> Option<Sample> {
        self.queue.inner.lock().expect("subscription queue mutex").pop_front()
    }
}

/// Run loop: connect, re-subscribe all tags, pump the queue; on loss,
/// reconnect with backoff and subscribe again.
pub(super) async fn run(
    spec: SourceSpec,
    queue_capacity: usize,
    mut client: Box<dyn SubscriptionClient>,
    mut ctx: CollectorContext,
    health: Arc<SourceHealthState>,
    cancel: CancellationToken,
) {
    let tags: Vec<String> = spec.tags.iter().map(|t| t.name.clone()).collect();
    let sink = SubscriptionSink::new(&spec.source_id, queue_capacity);
    let mut backoff = Backoff::new(spec.backoff);
    let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    'reconnect: loop {
        if cancel.is_cancelled() {
            break;
        }
        if let Err(e) = client.connect().await {
            health.mark_error(crate::types::now_ms());
            let delay = backoff.next_delay();
            tracing::warn!(
                source = %spec.source_id,
                error = %e,
                retry_ms = delay.as_millis() as u64,
                "Subscription connect failed"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => continue,
            }
        }
        health.mark_connected(true);
        backoff.reset();
        tracing::info!(source = %spec.source_id, tags = tags.len(), "Subscribed");

        // The subscription future borrows the client; scope it so the
        // borrow ends before close/reconnect.
        let lost = {
            let disconnected = client.run_subscription(&tags, sink.clone());
            tokio::pin!(disconnected);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break None,
                    error = &mut disconnected => break Some(error),
                    sample = sink.pop() => {
                        ctx.ingest(sample).await;
                    }
                    _ = housekeeping.tick() => {
                        ctx.housekeeping(crate::types::now_ms()).await;
                    }
                }
            }
        };

        match lost {
            None => {
                client.close().await;
                // Drain whatever the callbacks already queued.
                while let Some(sample) = sink.try_pop() {
                    ctx.ingest(sample).await;
                }
                break 'reconnect;
            }
            Some(error) => {
                health.mark_connected(false);
                health.mark_error(crate::types::now_ms());
                let delay = backoff.next_delay();
                tracing::warn!(
                    source = %spec.source_id,
                    error = %error,
                    retry_ms = delay.as_millis() as u64,
                    "Subscription lost, reconnecting"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break 'reconnect,
                    _ = tokio::time::sleep(delay) => continue 'reconnect,
                }
            }
        }
    }
    health.mark_connected(false);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_drop_oldest() {
        let sink = SubscriptionSink::new("plc_main", 3);
        for i in 0..5 {
            sink.push("thrust_total", i as f64, i * 1_000);
        }
        assert_eq!(sink.dropped_oldest(), 2);
        // Oldest two are gone; 2, 3, 4 remain in order.
        let mut values = Vec::new();
        while let Some(s) = sink.try_pop() {
            values.push(s.value);
        }
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
    }

    #[tokio::test]
    async fn test_sink_pop_wakes_on_push() {
        let sink = SubscriptionSink::new("plc_main", 8);
        let popper = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        sink.push("x", 1.5, 1_000);
        let sample = popper.await.unwrap();
        assert_eq!(sample.value, 1.5);
        assert_eq!(sample.source_id, "plc_main");
    }
}
