//! Per-worker batch accumulator.

use std::time::Duration;

use tokio::time::Instant;

use bookingprocessor_core::BookingMessage;

use crate::queue::Delivery;

/// Largest batch a worker will buffer. It doubles as the channel prefetch, so it must
/// stay well below what a broker or a `Semaphore` accepts.
pub const MAX_BATCH_SIZE: usize = 10_000;

/// Result of buffering one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Buffered; keep accumulating until the deadline.
    Buffered,
    /// The batch reached its maximum size and must be flushed now.
    Full,
}

/// Parsed messages paired 1:1 with their deliveries, in arrival order.
///
/// The flush deadline is armed when the first message enters an empty batch and
/// disarmed whenever the batch is drained, so a flush happens at most `window` after
/// the oldest buffered message arrived.
#[derive(Debug)]
pub struct Batch {
    entries: Vec<(BookingMessage, Delivery)>,
    max_size: usize,
    window: Duration,
    deadline: Option<Instant>,
}

impl Batch {
    /// `max_size` is clamped into `1..=MAX_BATCH_SIZE`.
    pub fn new(max_size: usize, window: Duration) -> Self {
        let max_size = max_size.clamp(1, MAX_BATCH_SIZE);
        Self {
            entries: Vec::with_capacity(max_size),
            max_size,
            window,
            deadline: None,
        }
    }

    pub fn push(&mut self, message: BookingMessage, delivery: Delivery, now: Instant) -> PushOutcome {
        if self.entries.is_empty() {
            self.deadline = Some(now + self.window);
        }
        self.entries.push((message, delivery));

        if self.entries.len() >= self.max_size {
            PushOutcome::Full
        } else {
            PushOutcome::Buffered
        }
    }

    /// When the current window closes; `None` while the batch is empty.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn iter(&self) -> impl Iterator<Item = &(BookingMessage, Delivery)> {
        self.entries.iter()
    }

    /// Remove every entry in arrival order; keeps the allocation and disarms the deadline.
    pub fn drain(&mut self) -> std::vec::Drain<'_, (BookingMessage, Delivery)> {
        self.deadline = None;
        self.entries.drain(..)
    }
}
