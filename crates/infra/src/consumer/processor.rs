//! Batch flush: register every item, then settle the batch as one unit.
//!
//! The registration calls are not atomic together (each is its own transaction), but
//! the visible queue effect is: either every delivery is acked, or none is.

use std::sync::Arc;

use tracing::{debug, error, warn};

use bookingprocessor_observability::ConsumerMetrics;

use super::batch::Batch;
use crate::queue::{Delivery, DiscardReason, Settlement};
use crate::registration::Registrar;

/// What a failed batch does with each delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    /// Deliveries already requeued this many times are discarded instead.
    /// `None` requeues forever.
    pub max_redeliveries: Option<u32>,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_redeliveries: Some(5),
        }
    }
}

impl RedeliveryPolicy {
    pub fn unbounded() -> Self {
        Self {
            max_redeliveries: None,
        }
    }

    pub fn settlement_after_failure(&self, redelivery_count: u32) -> Settlement {
        match self.max_redeliveries {
            Some(max) if redelivery_count >= max => {
                Settlement::Discard(DiscardReason::RedeliveriesExhausted)
            }
            _ => Settlement::Requeue,
        }
    }
}

/// Outcome of one flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing buffered; no broker interaction.
    Empty,
    /// Every item registered; every delivery acked.
    Committed { acked: usize },
    /// Item `failed_index` failed; no delivery acked.
    Rejected {
        failed_index: usize,
        requeued: usize,
        dead_lettered: usize,
    },
}

#[derive(Debug)]
pub struct BatchProcessor<R: ?Sized> {
    worker_id: usize,
    registrar: Arc<R>,
    metrics: Arc<ConsumerMetrics>,
    policy: RedeliveryPolicy,
}

impl<R> BatchProcessor<R>
where
    R: Registrar + ?Sized,
{
    pub fn new(
        worker_id: usize,
        registrar: Arc<R>,
        metrics: Arc<ConsumerMetrics>,
        policy: RedeliveryPolicy,
    ) -> Self {
        Self {
            worker_id,
            registrar,
            metrics,
            policy,
        }
    }

    /// Drain `batch` through the registrar and settle every delivery.
    ///
    /// Always leaves `batch` empty.
    pub async fn flush(&self, batch: &mut Batch) -> FlushOutcome {
        let n = batch.len();
        if n == 0 {
            return FlushOutcome::Empty;
        }

        let mut failed_index = None;
        for (i, (message, _)) in batch.iter().enumerate() {
            if let Err(err) = self.registrar.register(&message.user_email).await {
                warn!(
                    worker = self.worker_id,
                    index = i,
                    email = %message.user_email,
                    error = %err,
                    "registration failed; rejecting batch"
                );
                failed_index = Some(i);
                break;
            }
        }

        match failed_index {
            None => {
                for (_, delivery) in batch.drain() {
                    self.settle(delivery, Settlement::Ack).await;
                }
                self.metrics.record_committed(n);
                debug!(worker = self.worker_id, batch_size = n, "processed batch");
                FlushOutcome::Committed { acked: n }
            }
            Some(failed_index) => {
                let mut requeued = 0;
                let mut dead_lettered = 0;
                for (_, delivery) in batch.drain() {
                    let settlement = self
                        .policy
                        .settlement_after_failure(delivery.redelivery_count());
                    if settlement == Settlement::Requeue {
                        requeued += 1;
                    } else {
                        warn!(
                            worker = self.worker_id,
                            tag = %delivery.tag(),
                            redelivery_count = delivery.redelivery_count(),
                            "redeliveries exhausted; dead-lettering"
                        );
                        dead_lettered += 1;
                    }
                    self.settle(delivery, settlement).await;
                }
                self.metrics.record_requeued(requeued, dead_lettered);
                warn!(
                    worker = self.worker_id,
                    batch_size = n,
                    failed_index,
                    requeued,
                    dead_lettered,
                    "batch rejected"
                );
                FlushOutcome::Rejected {
                    failed_index,
                    requeued,
                    dead_lettered,
                }
            }
        }
    }

    async fn settle(&self, delivery: Delivery, settlement: Settlement) {
        let tag = delivery.tag().to_string();
        if let Err(err) = delivery.settle(settlement).await {
            self.metrics.record_settle_failure();
            error!(
                worker = self.worker_id,
                tag = %tag,
                settlement = ?settlement,
                error = %err,
                "failed to settle delivery"
            );
        }
    }
}
