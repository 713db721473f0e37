//! Deliveries, their terminal actions, and the per-worker delivery channel.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tokio::task::JoinHandle;

/// Queue operation error.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("unknown delivery: {0}")]
    UnknownDelivery(String),

    #[error("queue is closed")]
    Closed,
}

/// Why a delivery is being discarded instead of requeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The payload could not be decoded; redelivering the same bytes cannot help.
    Malformed,
    /// The payload was requeued too many times.
    RedeliveriesExhausted,
}

impl DiscardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::Malformed => "malformed",
            DiscardReason::RedeliveriesExhausted => "redeliveries_exhausted",
        }
    }
}

/// Terminal action for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Fully processed; remove from the queue.
    Ack,
    /// Nack with requeue: return the payload for redelivery as a new delivery.
    Requeue,
    /// Nack without requeue: drop (or dead-letter) the payload.
    Discard(DiscardReason),
}

/// Broker side of a delivery: applies terminal actions.
#[async_trait]
pub trait Acknowledger: Send + Sync + fmt::Debug {
    async fn settle(&self, delivery: &Delivery, settlement: Settlement) -> Result<(), QueueError>;

    /// Called when a delivery is dropped without a terminal action (e.g. it was still
    /// buffered in a channel when its worker stopped). Brokers that redeliver such
    /// entries on their own can ignore this.
    fn release(&self, _delivery: &Delivery) {}
}

/// One unit of work received from the queue, with the handle to settle it.
///
/// Terminal actions consume the delivery, so it can be settled at most once.
pub struct Delivery {
    tag: String,
    payload: Vec<u8>,
    redelivery_count: u32,
    acker: Arc<dyn Acknowledger>,
    permit: Option<OwnedSemaphorePermit>,
    settled: bool,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("payload_len", &self.payload.len())
            .field("redelivery_count", &self.redelivery_count)
            .finish()
    }
}

impl Delivery {
    pub fn new(
        tag: impl Into<String>,
        payload: Vec<u8>,
        redelivery_count: u32,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            tag: tag.into(),
            payload,
            redelivery_count,
            acker,
            permit: None,
            settled: false,
        }
    }

    /// Attach a prefetch slot; it is returned to the channel once the delivery is
    /// settled or dropped.
    pub fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self.permit = Some(permit);
        self
    }

    /// Broker-assigned identifier.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// How many times this payload was requeued before this delivery (0 = first).
    pub fn redelivery_count(&self) -> u32 {
        self.redelivery_count
    }

    pub async fn ack(self) -> Result<(), QueueError> {
        self.settle(Settlement::Ack).await
    }

    /// Nack with requeue.
    pub async fn requeue(self) -> Result<(), QueueError> {
        self.settle(Settlement::Requeue).await
    }

    /// Nack without requeue.
    pub async fn discard(self, reason: DiscardReason) -> Result<(), QueueError> {
        self.settle(Settlement::Discard(reason)).await
    }

    pub async fn settle(mut self, settlement: Settlement) -> Result<(), QueueError> {
        let acker = Arc::clone(&self.acker);
        let result = acker.settle(&self, settlement).await;
        // The action was issued either way; a refused settle is left to the broker.
        self.settled = true;
        result
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.settled {
            let acker = Arc::clone(&self.acker);
            acker.release(self);
        }
    }
}

/// Aborts the broker-side feeder task when the channel goes away.
#[derive(Debug)]
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A worker's dedicated subscription.
///
/// Deliveries arrive through a bounded channel fed by a broker task, so `recv` is
/// cancel-safe and can sit inside `tokio::select!` without losing deliveries.
#[derive(Debug)]
pub struct DeliveryChannel {
    receiver: mpsc::Receiver<Delivery>,
    _feeder: Option<AbortOnDrop>,
}

impl DeliveryChannel {
    pub fn new(receiver: mpsc::Receiver<Delivery>) -> Self {
        Self {
            receiver,
            _feeder: None,
        }
    }

    /// Channel whose feeder task is aborted when the channel is dropped.
    pub fn with_feeder(receiver: mpsc::Receiver<Delivery>, feeder: JoinHandle<()>) -> Self {
        Self {
            receiver,
            _feeder: Some(AbortOnDrop(feeder)),
        }
    }

    /// Wait for the next delivery; `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

/// A queue that hands out per-worker subscriptions.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a dedicated subscription holding at most `prefetch` unsettled deliveries.
    async fn open_channel(&self, consumer: &str, prefetch: usize)
    -> Result<DeliveryChannel, QueueError>;
}

#[async_trait]
impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    async fn open_channel(
        &self,
        consumer: &str,
        prefetch: usize,
    ) -> Result<DeliveryChannel, QueueError> {
        (**self).open_channel(consumer, prefetch).await
    }
}
