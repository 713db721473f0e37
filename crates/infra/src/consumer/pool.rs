//! Pool coordinator: N independent workers sharing one cancellation token.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use bookingprocessor_observability::ConsumerMetrics;

use super::batch::{Batch, MAX_BATCH_SIZE};
use super::processor::{BatchProcessor, RedeliveryPolicy};
use super::worker::{Worker, WorkerReport};
use crate::queue::Broker;
use crate::registration::Registrar;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 50;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_MAX_REDELIVERIES: u32 = 5;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of workers; at least one is always started.
    pub workers: usize,
    /// Flush threshold, also used as each channel's prefetch. Clamped into
    /// `1..=MAX_BATCH_SIZE` when workers start.
    pub max_batch_size: usize,
    pub flush_interval: Duration,
    /// `None` requeues failed batches forever.
    pub max_redeliveries: Option<u32>,
    /// Prefix for broker-visible consumer names.
    pub consumer_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_redeliveries: Some(DEFAULT_MAX_REDELIVERIES),
            consumer_prefix: "bookingprocessor".to_string(),
        }
    }
}

impl PoolConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_max_redeliveries(mut self, max: Option<u32>) -> Self {
        self.max_redeliveries = max;
        self
    }

    pub fn with_consumer_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.consumer_prefix = prefix.into();
        self
    }
}

/// Launches workers against a broker and a shared registrar.
#[derive(Debug)]
pub struct ConsumerPool<B: ?Sized, R: ?Sized> {
    broker: Arc<B>,
    registrar: Arc<R>,
    metrics: Arc<ConsumerMetrics>,
    config: PoolConfig,
}

impl<B, R> ConsumerPool<B, R>
where
    B: Broker + ?Sized + 'static,
    R: Registrar + ?Sized + 'static,
{
    pub fn new(
        broker: Arc<B>,
        registrar: Arc<R>,
        metrics: Arc<ConsumerMetrics>,
        config: PoolConfig,
    ) -> Self {
        Self {
            broker,
            registrar,
            metrics,
            config,
        }
    }

    /// Spawn every worker and return immediately.
    pub fn start(self) -> PoolHandle {
        let shutdown = CancellationToken::new();
        let count = self.config.workers.max(1);
        let policy = RedeliveryPolicy {
            max_redeliveries: self.config.max_redeliveries,
        };

        info!(
            workers = count,
            max_batch_size = self.config.max_batch_size.clamp(1, MAX_BATCH_SIZE),
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            "starting consumer pool"
        );

        let workers = (0..count)
            .map(|id| {
                let broker = Arc::clone(&self.broker);
                let processor = BatchProcessor::new(
                    id,
                    Arc::clone(&self.registrar),
                    Arc::clone(&self.metrics),
                    policy,
                );
                let metrics = Arc::clone(&self.metrics);
                let config = self.config.clone();
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    let consumer = format!("{}-{}-{}", config.consumer_prefix, id, Uuid::now_v7());
                    let batch = Batch::new(config.max_batch_size, config.flush_interval);
                    let channel = match broker.open_channel(&consumer, batch.max_size()).await {
                        Ok(channel) => channel,
                        Err(err) => {
                            error!(worker = id, consumer = %consumer, error = %err, "failed to open delivery channel");
                            return None;
                        }
                    };
                    let worker = Worker::new(id, channel, batch, processor, metrics, shutdown);
                    Some(worker.run().await)
                })
            })
            .collect();

        PoolHandle {
            shutdown,
            workers,
            metrics: self.metrics,
        }
    }
}

/// Totals for a finished pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolReport {
    /// Reports of workers that ran to completion.
    pub workers: Vec<WorkerReport>,
    /// Workers that exited without joining the pool (channel setup failed or panicked).
    pub failed: usize,
}

impl PoolReport {
    pub fn processed(&self) -> u64 {
        self.workers.iter().map(|w| w.processed).sum()
    }
}

/// Handle to a running pool.
#[derive(Debug)]
pub struct PoolHandle {
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<Option<WorkerReport>>>,
    metrics: Arc<ConsumerMetrics>,
}

impl PoolHandle {
    /// The token every worker observes; cancelling it stops the pool.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn metrics(&self) -> &Arc<ConsumerMetrics> {
        &self.metrics
    }

    /// Request shutdown and wait for every worker to finish its final flush.
    pub async fn shutdown(self) -> PoolReport {
        info!("stopping consumer pool");
        self.shutdown.cancel();
        self.join().await
    }

    /// Wait for every worker to terminate.
    pub async fn join(self) -> PoolReport {
        let mut report = PoolReport::default();
        for handle in self.workers {
            match handle.await {
                Ok(Some(worker)) => report.workers.push(worker),
                Ok(None) => report.failed += 1,
                Err(err) => {
                    error!(error = %err, "worker task panicked");
                    report.failed += 1;
                }
            }
        }
        info!(
            workers = report.workers.len(),
            failed = report.failed,
            processed = report.processed(),
            "consumer pool stopped"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use bookingprocessor_core::BookingMessage;

    use super::*;
    use crate::queue::InMemoryQueue;
    use crate::registration::InMemoryRegistry;

    fn publish(queue: &InMemoryQueue, n: usize) {
        for i in 0..n {
            queue.publish(
                BookingMessage::new(i as i64, format!("user{i}@example.com"), "hotel").to_payload(),
            );
        }
    }

    #[test]
    fn defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.workers, 1);
        assert_eq!(config.max_batch_size, 50);
        assert_eq!(config.flush_interval, Duration::from_millis(200));
        assert_eq!(config.max_redeliveries, Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn workers_share_the_queue_and_the_counter() {
        let queue = Arc::new(InMemoryQueue::new());
        publish(&queue, 120);
        let registry = Arc::new(InMemoryRegistry::new());
        let metrics = Arc::new(ConsumerMetrics::new().unwrap());

        let handle = ConsumerPool::new(
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&metrics),
            PoolConfig::default().with_workers(4).with_max_batch_size(10),
        )
        .start();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let report = handle.shutdown().await;

        assert_eq!(report.workers.len(), 4);
        assert_eq!(report.failed, 0);
        assert_eq!(report.processed(), 120);
        assert_eq!(metrics.processed(), 120);
        assert_eq!(registry.registered_emails().len(), 120);
        assert_eq!(queue.unacked_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_workers_still_starts_one() {
        let queue = Arc::new(InMemoryQueue::new());
        let handle = ConsumerPool::new(
            queue,
            Arc::new(InMemoryRegistry::new()),
            Arc::new(ConsumerMetrics::new().unwrap()),
            PoolConfig::default().with_workers(0),
        )
        .start();

        let report = handle.shutdown().await;
        assert_eq!(report.workers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_failure_only_stops_that_worker() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.refuse_channels(1);
        publish(&queue, 30);
        let metrics = Arc::new(ConsumerMetrics::new().unwrap());

        let handle = ConsumerPool::new(
            Arc::clone(&queue),
            Arc::new(InMemoryRegistry::new()),
            Arc::clone(&metrics),
            PoolConfig::default().with_workers(3),
        )
        .start();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let report = handle.shutdown().await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.workers.len(), 2);
        assert_eq!(metrics.processed(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn join_returns_once_the_queue_closes() {
        let queue = Arc::new(InMemoryQueue::new());
        publish(&queue, 5);
        let handle = ConsumerPool::new(
            Arc::clone(&queue),
            Arc::new(InMemoryRegistry::new()),
            Arc::new(ConsumerMetrics::new().unwrap()),
            PoolConfig::default().with_workers(2),
        )
        .start();

        tokio::time::sleep(Duration::from_millis(500)).await;
        queue.close();
        let report = handle.join().await;

        assert_eq!(report.processed(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_batch_size_still_starts_every_worker() {
        let queue = Arc::new(InMemoryQueue::new());
        publish(&queue, 3);
        let handle = ConsumerPool::new(
            Arc::clone(&queue),
            Arc::new(InMemoryRegistry::new()),
            Arc::new(ConsumerMetrics::new().unwrap()),
            PoolConfig::default()
                .with_workers(2)
                .with_max_batch_size(usize::MAX),
        )
        .start();

        tokio::time::sleep(Duration::from_millis(500)).await;
        let report = handle.shutdown().await;

        assert_eq!(report.failed, 0);
        assert_eq!(report.workers.len(), 2);
        assert_eq!(report.processed(), 3);
    }
}
