//! Infrastructure layer: queue brokers, registration store, consumer pool, config.

pub mod config;
pub mod consumer;
pub mod db;
pub mod queue;
pub mod registration;
