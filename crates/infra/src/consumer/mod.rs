//! Batching queue consumer.
//!
//! Each worker owns one delivery channel and one batch. A batch is flushed when it
//! reaches its maximum size, when its window closes, or on shutdown; the flush
//! registers every item and then acks the whole batch, or requeues the whole batch if
//! any registration failed.

pub mod batch;
pub mod pool;
pub mod processor;
pub mod worker;

pub use batch::{Batch, MAX_BATCH_SIZE, PushOutcome};
pub use pool::{
    ConsumerPool, DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_BATCH_SIZE, DEFAULT_MAX_REDELIVERIES,
    PoolConfig, PoolHandle, PoolReport,
};
pub use processor::{BatchProcessor, FlushOutcome, RedeliveryPolicy};
pub use worker::{Worker, WorkerEvent, WorkerReport, WorkerState};
