//! Consumer metrics.
//!
//! Every counter lives in a registry owned by [`ConsumerMetrics`] rather than the
//! process-global default registry, so independent pools (and tests) never collide
//! on metric names.
//!
//! | Metric | Meaning |
//! |--------|---------|
//! | `booking_processor_requests_total` | bookings registered and acked |
//! | `booking_processor_requeued_total` | deliveries nacked with requeue |
//! | `booking_processor_dropped_total` | malformed payloads discarded |
//! | `booking_processor_dead_lettered_total` | deliveries discarded after the redelivery cap |
//! | `booking_processor_batches_committed_total` | batches acked as a whole |
//! | `booking_processor_batches_requeued_total` | batches rejected as a whole |
//! | `booking_processor_settle_failures_total` | ack/nack calls the broker refused |

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metric registration failed: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("metrics text is not valid UTF-8")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Counters shared by every worker of a pool.
///
/// Increments are atomic; clone the surrounding `Arc` to share.
#[derive(Debug, Clone)]
pub struct ConsumerMetrics {
    registry: Registry,
    processed: IntCounter,
    requeued: IntCounter,
    dropped: IntCounter,
    dead_lettered: IntCounter,
    batches_committed: IntCounter,
    batches_requeued: IntCounter,
    settle_failures: IntCounter,
}

/// Point-in-time copy of the counters, for logs and assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub requeued: u64,
    pub dropped: u64,
    pub dead_lettered: u64,
    pub batches_committed: u64,
    pub batches_requeued: u64,
    pub settle_failures: u64,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, MetricsError> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

impl ConsumerMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        Ok(Self {
            processed: counter(
                &registry,
                "booking_processor_requests_total",
                "Total bookings processed from queue",
            )?,
            requeued: counter(
                &registry,
                "booking_processor_requeued_total",
                "Deliveries returned to the queue after a failed batch",
            )?,
            dropped: counter(
                &registry,
                "booking_processor_dropped_total",
                "Malformed deliveries discarded without requeue",
            )?,
            dead_lettered: counter(
                &registry,
                "booking_processor_dead_lettered_total",
                "Deliveries discarded after exhausting redeliveries",
            )?,
            batches_committed: counter(
                &registry,
                "booking_processor_batches_committed_total",
                "Batches whose deliveries were all acknowledged",
            )?,
            batches_requeued: counter(
                &registry,
                "booking_processor_batches_requeued_total",
                "Batches rejected because one registration failed",
            )?,
            settle_failures: counter(
                &registry,
                "booking_processor_settle_failures_total",
                "Ack or nack calls that failed at the broker",
            )?,
            registry,
        })
    }

    /// The success counter: bookings registered and acknowledged.
    pub fn processed(&self) -> u64 {
        self.processed.get()
    }

    pub fn record_committed(&self, batch_len: usize) {
        self.processed.inc_by(batch_len as u64);
        self.batches_committed.inc();
    }

    pub fn record_requeued(&self, requeued: usize, dead_lettered: usize) {
        self.requeued.inc_by(requeued as u64);
        self.dead_lettered.inc_by(dead_lettered as u64);
        self.batches_requeued.inc();
    }

    pub fn record_dropped(&self) {
        self.dropped.inc();
    }

    pub fn record_settle_failure(&self) {
        self.settle_failures.inc();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.processed.get(),
            requeued: self.requeued.get(),
            dropped: self.dropped.get(),
            dead_lettered: self.dead_lettered.get(),
            batches_committed: self.batches_committed.get(),
            batches_requeued: self.batches_requeued.get(),
            settle_failures: self.settle_failures.get(),
        }
    }

    /// Encode every counter in Prometheus text format.
    pub fn gather(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        let families = self.registry.gather();
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .map_err(MetricsError::Registration)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_batches_advance_the_success_counter() {
        let metrics = ConsumerMetrics::new().unwrap();
        metrics.record_committed(10);
        metrics.record_committed(5);

        assert_eq!(metrics.processed(), 15);
        assert_eq!(metrics.snapshot().batches_committed, 2);
    }

    #[test]
    fn requeued_batches_leave_the_success_counter_alone() {
        let metrics = ConsumerMetrics::new().unwrap();
        metrics.record_requeued(49, 1);

        let snap = metrics.snapshot();
        assert_eq!(snap.processed, 0);
        assert_eq!(snap.requeued, 49);
        assert_eq!(snap.dead_lettered, 1);
        assert_eq!(snap.batches_requeued, 1);
    }

    #[test]
    fn independent_instances_do_not_collide() {
        let a = ConsumerMetrics::new().unwrap();
        let b = ConsumerMetrics::new().unwrap();
        a.record_committed(3);
        assert_eq!(b.processed(), 0);
    }

    #[test]
    fn gather_exposes_counter_names() {
        let metrics = ConsumerMetrics::new().unwrap();
        metrics.record_dropped();

        let text = metrics.gather().unwrap();
        assert!(text.contains("booking_processor_requests_total"));
        assert!(text.contains("booking_processor_dropped_total 1"));
    }
}
