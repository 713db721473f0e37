//! `bookingprocessor` process wiring: metrics endpoint, signal handling, startup.

pub mod app;
pub mod http;
pub mod shutdown;
