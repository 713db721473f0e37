//! In-memory queue for tests/dev.
//!
//! Behaves like a durable broker queue with manual acknowledgment:
//! - each subscription holds at most `prefetch` unsettled deliveries
//! - requeued payloads go to the back of the queue as new deliveries
//! - deliveries dropped without a terminal action go back to the front
//! - discarded payloads land in a dead-letter list
//!
//! Every terminal action is recorded so tests can assert on exact ack/nack sequences.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore, mpsc};
use tracing::debug;

use super::delivery::{
    Acknowledger, Broker, Delivery, DeliveryChannel, DiscardReason, QueueError, Settlement,
};

/// One terminal action applied to a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRecord {
    pub tag: String,
    pub payload: Vec<u8>,
    pub redelivery_count: u32,
    pub settlement: Settlement,
}

/// A payload discarded without requeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub payload: Vec<u8>,
    pub reason: DiscardReason,
    pub redelivery_count: u32,
}

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    redelivery_count: u32,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Message>,
    unacked: HashMap<String, Message>,
    settlements: Vec<SettlementRecord>,
    dead_letters: Vec<DeadLetter>,
    next_tag: u64,
    closed: bool,
    refuse_settlements: bool,
    refuse_channels: usize,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not wedge every other subscriber.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for the next ready message and move it to the unacked set.
    ///
    /// Returns `None` once the queue is closed.
    async fn next_message(&self) -> Option<(String, Message)> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(message) = state.ready.pop_front() {
                    state.next_tag += 1;
                    let tag = format!("mem-{}", state.next_tag);
                    state.unacked.insert(tag.clone(), message.clone());
                    return Some((tag, message));
                }
            }

            notified.await;
        }
    }
}

#[async_trait]
impl Acknowledger for Inner {
    async fn settle(&self, delivery: &Delivery, settlement: Settlement) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.refuse_settlements {
            return Err(QueueError::Command("settlement refused".to_string()));
        }

        let message = state
            .unacked
            .remove(delivery.tag())
            .ok_or_else(|| QueueError::UnknownDelivery(delivery.tag().to_string()))?;

        state.settlements.push(SettlementRecord {
            tag: delivery.tag().to_string(),
            payload: message.payload.clone(),
            redelivery_count: message.redelivery_count,
            settlement,
        });

        match settlement {
            Settlement::Ack => {}
            Settlement::Requeue => {
                state.ready.push_back(Message {
                    payload: message.payload,
                    redelivery_count: message.redelivery_count + 1,
                });
                drop(state);
                self.notify.notify_one();
            }
            Settlement::Discard(reason) => {
                state.dead_letters.push(DeadLetter {
                    payload: message.payload,
                    reason,
                    redelivery_count: message.redelivery_count,
                });
            }
        }

        Ok(())
    }

    fn release(&self, delivery: &Delivery) {
        let mut state = self.lock();
        if let Some(message) = state.unacked.remove(delivery.tag()) {
            state.ready.push_front(message);
            drop(state);
            self.notify.notify_one();
        }
    }
}

/// In-memory named queue.
///
/// Cloning yields another handle to the same queue.
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueue {
    inner: Arc<Inner>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, payload: impl Into<Vec<u8>>) {
        self.inner.lock().ready.push_back(Message {
            payload: payload.into(),
            redelivery_count: 0,
        });
        self.inner.notify.notify_one();
    }

    /// End every subscription; channels drain what they already hold, then close.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.inner.notify.notify_waiters();
    }

    /// Make every subsequent ack/nack fail, as if the channel had been lost.
    pub fn refuse_settlements(&self, refuse: bool) {
        self.inner.lock().refuse_settlements = refuse;
    }

    /// Make the next `count` `open_channel` calls fail.
    pub fn refuse_channels(&self, count: usize) {
        self.inner.lock().refuse_channels = count;
    }

    pub fn settlements(&self) -> Vec<SettlementRecord> {
        self.inner.lock().settlements.clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().dead_letters.clone()
    }

    /// Messages waiting to be delivered.
    pub fn ready_len(&self) -> usize {
        self.inner.lock().ready.len()
    }

    /// Deliveries handed out and not yet settled.
    pub fn unacked_len(&self) -> usize {
        self.inner.lock().unacked.len()
    }
}

async fn feed(inner: Arc<Inner>, tx: mpsc::Sender<Delivery>, prefetch: Arc<Semaphore>) {
    loop {
        let permit = tokio::select! {
            permit = Arc::clone(&prefetch).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = tx.closed() => return,
        };

        let next = tokio::select! {
            next = inner.next_message() => next,
            _ = tx.closed() => return,
        };
        let Some((tag, message)) = next else {
            return;
        };

        let acker: Arc<dyn Acknowledger> = inner.clone();
        let delivery = Delivery::new(tag, message.payload, message.redelivery_count, acker)
            .with_permit(permit);

        // A refused send drops the delivery, which releases it back to the queue.
        if tx.send(delivery).await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl Broker for InMemoryQueue {
    async fn open_channel(
        &self,
        consumer: &str,
        prefetch: usize,
    ) -> Result<DeliveryChannel, QueueError> {
        {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            if state.refuse_channels > 0 {
                state.refuse_channels -= 1;
                return Err(QueueError::Connection(format!(
                    "channel refused for {consumer}"
                )));
            }
        }

        let prefetch = prefetch.max(1);
        let (tx, rx) = mpsc::channel(prefetch);
        let feeder = tokio::spawn(feed(
            Arc::clone(&self.inner),
            tx,
            Arc::new(Semaphore::new(prefetch)),
        ));

        debug!(consumer, prefetch, "opened in-memory channel");
        Ok(DeliveryChannel::with_feeder(rx, feeder))
    }
}
