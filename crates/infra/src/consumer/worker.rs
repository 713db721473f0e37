//! One consumer task: a delivery channel, a batch and a flush deadline.

use std::future;
use std::sync::Arc;

use serde::Serialize;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bookingprocessor_core::BookingMessage;
use bookingprocessor_observability::ConsumerMetrics;

use super::batch::{Batch, PushOutcome};
use super::processor::{BatchProcessor, FlushOutcome};
use crate::queue::{Delivery, DeliveryChannel, DiscardReason};
use crate::registration::Registrar;

/// Worker lifecycle.
///
/// `Idle → Accumulating → Flushing → {Idle | Terminated}`; shutdown and channel close
/// take any state through a final flush into `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Accumulating,
    Flushing,
    Terminated,
}

/// What woke the worker up.
#[derive(Debug)]
pub enum WorkerEvent {
    Delivery(Delivery),
    DeadlineElapsed,
    Shutdown,
    /// The subscription ended on the broker side.
    ChannelClosed,
}

/// Per-worker totals, returned when the worker terminates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub deliveries: u64,
    pub processed: u64,
    pub malformed: u64,
    pub batches_committed: u64,
    pub batches_rejected: u64,
}

#[derive(Debug)]
pub struct Worker<R: ?Sized> {
    id: usize,
    channel: DeliveryChannel,
    batch: Batch,
    processor: BatchProcessor<R>,
    metrics: Arc<ConsumerMetrics>,
    shutdown: CancellationToken,
    state: WorkerState,
    report: WorkerReport,
}

impl<R> Worker<R>
where
    R: Registrar + ?Sized,
{
    pub fn new(
        id: usize,
        channel: DeliveryChannel,
        batch: Batch,
        processor: BatchProcessor<R>,
        metrics: Arc<ConsumerMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            channel,
            batch,
            processor,
            metrics,
            shutdown,
            state: WorkerState::Idle,
            report: WorkerReport {
                worker_id: id,
                ..WorkerReport::default()
            },
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Run until shutdown or until the channel closes.
    ///
    /// Deliveries still sitting in the channel at that point were never received and
    /// are released back to the broker when the channel is dropped.
    pub async fn run(mut self) -> WorkerReport {
        info!(worker = self.id, "worker started");
        while self.state != WorkerState::Terminated {
            let event = self.next_event().await;
            self.handle(event).await;
        }
        info!(
            worker = self.id,
            processed = self.report.processed,
            malformed = self.report.malformed,
            "worker stopped"
        );
        self.report
    }

    /// Wait for whichever event source is ready first.
    ///
    /// Shutdown wins over a due deadline, which wins over new deliveries.
    pub async fn next_event(&mut self) -> WorkerEvent {
        let deadline = self.batch.deadline();
        tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => WorkerEvent::Shutdown,
            _ = wait_until(deadline) => WorkerEvent::DeadlineElapsed,
            delivery = self.channel.recv() => match delivery {
                Some(delivery) => WorkerEvent::Delivery(delivery),
                None => WorkerEvent::ChannelClosed,
            },
        }
    }

    /// Apply one event; returns the state the worker ends up in.
    pub async fn handle(&mut self, event: WorkerEvent) -> WorkerState {
        match event {
            WorkerEvent::Delivery(delivery) => {
                self.report.deliveries += 1;
                self.accept(delivery).await;
            }
            WorkerEvent::DeadlineElapsed => {
                self.flush().await;
            }
            WorkerEvent::Shutdown => {
                debug!(worker = self.id, buffered = self.batch.len(), "shutdown requested");
                self.flush().await;
                self.state = WorkerState::Terminated;
            }
            WorkerEvent::ChannelClosed => {
                warn!(worker = self.id, buffered = self.batch.len(), "delivery channel closed");
                self.flush().await;
                self.state = WorkerState::Terminated;
            }
        }
        self.state
    }

    async fn accept(&mut self, delivery: Delivery) {
        let message = match BookingMessage::from_payload(delivery.payload()) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    worker = self.id,
                    tag = %delivery.tag(),
                    error = %err,
                    "dropping malformed message"
                );
                self.report.malformed += 1;
                self.metrics.record_dropped();
                if let Err(err) = delivery.discard(DiscardReason::Malformed).await {
                    self.metrics.record_settle_failure();
                    warn!(worker = self.id, error = %err, "failed to discard malformed message");
                }
                return;
            }
        };

        match self.batch.push(message, delivery, Instant::now()) {
            PushOutcome::Buffered => self.state = WorkerState::Accumulating,
            PushOutcome::Full => self.flush().await,
        }
    }

    async fn flush(&mut self) {
        self.state = WorkerState::Flushing;
        match self.processor.flush(&mut self.batch).await {
            FlushOutcome::Empty => {}
            FlushOutcome::Committed { acked } => {
                self.report.processed += acked as u64;
                self.report.batches_committed += 1;
            }
            FlushOutcome::Rejected { .. } => {
                self.report.batches_rejected += 1;
            }
        }
        self.state = WorkerState::Idle;
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::consumer::RedeliveryPolicy;
    use crate::queue::{Broker, InMemoryQueue, Settlement};
    use crate::registration::{InMemoryRegistry, RegistrationError};

    const WINDOW: Duration = Duration::from_millis(200);

    struct Fixture {
        queue: InMemoryQueue,
        registry: Arc<InMemoryRegistry>,
        metrics: Arc<ConsumerMetrics>,
        shutdown: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                queue: InMemoryQueue::new(),
                registry: Arc::new(InMemoryRegistry::new()),
                metrics: Arc::new(ConsumerMetrics::new().unwrap()),
                shutdown: CancellationToken::new(),
            }
        }

        fn publish(&self, n: usize) {
            for i in 0..n {
                self.queue.publish(
                    BookingMessage::new(i as i64, format!("user{i}@example.com"), "hotel")
                        .to_payload(),
                );
            }
        }

        async fn worker(&self, max_batch: usize) -> Worker<InMemoryRegistry> {
            self.worker_with(Arc::clone(&self.registry), max_batch).await
        }

        async fn worker_with<R: Registrar>(&self, registrar: Arc<R>, max_batch: usize) -> Worker<R> {
            let channel = self.queue.open_channel("w0", max_batch).await.unwrap();
            let processor = BatchProcessor::new(
                0,
                registrar,
                Arc::clone(&self.metrics),
                RedeliveryPolicy::default(),
            );
            Worker::new(
                0,
                channel,
                Batch::new(max_batch, WINDOW),
                processor,
                Arc::clone(&self.metrics),
                self.shutdown.clone(),
            )
        }
    }

    /// Requests shutdown from inside the first registration, then keeps the flush busy.
    struct ShutdownMidFlush {
        inner: Arc<InMemoryRegistry>,
        shutdown: CancellationToken,
    }

    #[async_trait]
    impl Registrar for ShutdownMidFlush {
        async fn register(&self, email: &str) -> Result<(), RegistrationError> {
            self.shutdown.cancel();
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.inner.register(email).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_waits_for_the_window() {
        let f = Fixture::new();
        f.publish(10);
        let mut worker = f.worker(50).await;

        let start = Instant::now();
        for _ in 0..10 {
            let event = worker.next_event().await;
            assert!(matches!(event, WorkerEvent::Delivery(_)));
            assert_eq!(worker.handle(event).await, WorkerState::Accumulating);
        }
        assert_eq!(f.metrics.processed(), 0);

        let event = worker.next_event().await;
        assert!(matches!(event, WorkerEvent::DeadlineElapsed));
        assert!(start.elapsed() >= WINDOW);
        assert_eq!(worker.handle(event).await, WorkerState::Idle);
        assert_eq!(f.metrics.processed(), 10);
        assert_eq!(f.queue.settlements().len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_flushes_without_waiting() {
        let f = Fixture::new();
        f.publish(50);
        let mut worker = f.worker(50).await;

        let start = Instant::now();
        for _ in 0..50 {
            let event = worker.next_event().await;
            worker.handle(event).await;
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(worker.state(), WorkerState::Idle);
        assert_eq!(f.metrics.processed(), 50);
        assert!(
            f.queue
                .settlements()
                .iter()
                .all(|s| s.settlement == Settlement::Ack)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payload_never_enters_the_batch() {
        let f = Fixture::new();
        f.queue.publish(b"not json".to_vec());
        let mut worker = f.worker(50).await;

        let event = worker.next_event().await;
        assert_eq!(worker.handle(event).await, WorkerState::Idle);

        let settled = f.queue.settlements();
        assert_eq!(settled.len(), 1);
        assert_eq!(
            settled[0].settlement,
            Settlement::Discard(DiscardReason::Malformed)
        );
        assert_eq!(f.metrics.snapshot().dropped, 1);
        assert_eq!(f.metrics.processed(), 0);
        assert_eq!(f.registry.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_buffered_items_first() {
        let f = Fixture::new();
        f.publish(5);
        let mut worker = f.worker(50).await;

        for _ in 0..5 {
            let event = worker.next_event().await;
            worker.handle(event).await;
        }
        f.shutdown.cancel();

        let event = worker.next_event().await;
        assert!(matches!(event, WorkerEvent::Shutdown));
        assert_eq!(worker.handle(event).await, WorkerState::Terminated);
        assert_eq!(f.registry.calls(), 5);
        assert_eq!(f.metrics.processed(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_wins_over_pending_deliveries() {
        let f = Fixture::new();
        f.publish(3);
        let worker = f.worker(50).await;
        f.shutdown.cancel();

        let report = worker.run().await;

        assert_eq!(report.deliveries, 0);
        assert_eq!(f.registry.calls(), 0);
        // Never received, so returned to the queue rather than settled.
        assert!(f.queue.settlements().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_flush_lets_the_batch_commit() {
        let f = Fixture::new();
        f.publish(3);
        let registrar = Arc::new(ShutdownMidFlush {
            inner: Arc::clone(&f.registry),
            shutdown: f.shutdown.clone(),
        });
        let worker = f.worker_with(registrar, 3).await;

        let report = worker.run().await;

        assert!(f.shutdown.is_cancelled());
        assert_eq!(report.deliveries, 3);
        assert_eq!(report.processed, 3);
        assert_eq!(report.batches_committed, 1);
        assert_eq!(report.batches_rejected, 0);
        assert_eq!(f.registry.registered_emails().len(), 3);

        let settled = f.queue.settlements();
        assert_eq!(settled.len(), 3);
        assert!(settled.iter().all(|s| s.settlement == Settlement::Ack));
        assert_eq!(f.queue.unacked_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_channel_flushes_and_terminates() {
        let f = Fixture::new();
        f.publish(4);
        let worker = f.worker(50).await;
        // Let the channel pick everything up before the queue goes away.
        tokio::time::sleep(Duration::from_millis(1)).await;
        f.queue.close();

        let report = worker.run().await;

        assert_eq!(report.deliveries, 4);
        assert_eq!(report.processed, 4);
        assert_eq!(report.batches_rejected, 0);
        assert_eq!(f.queue.unacked_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_reports_committed_batches() {
        let f = Fixture::new();
        f.publish(7);
        let worker = f.worker(3).await;
        let shutdown = f.shutdown.clone();
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(WINDOW * 2).await;
        shutdown.cancel();
        let report = handle.await.unwrap();

        // 3 + 3 on size, the last one on the deadline.
        assert_eq!(report.processed, 7);
        assert_eq!(report.batches_committed, 3);
        assert_eq!(f.metrics.processed(), 7);
    }
}
