//! Durable queue boundary.
//!
//! `delivery` defines the broker-agnostic mechanics (deliveries, terminal actions,
//! per-worker channels). This module also provides the broker implementations:
//! an in-memory queue for tests/dev, Redis Streams behind the `redis` feature and
//! AMQP 0-9-1 (RabbitMQ) behind the `amqp` feature.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod delivery;
pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "amqp")]
pub use amqp::AmqpQueue;
pub use delivery::{
    Acknowledger, Broker, Delivery, DeliveryChannel, DiscardReason, QueueError, Settlement,
};
pub use in_memory::{DeadLetter, InMemoryQueue, SettlementRecord};
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsQueue;
