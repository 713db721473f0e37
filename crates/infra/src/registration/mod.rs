//! Downstream registration boundary.
//!
//! The consumer only needs "register one booking's user" (succeeds or fails) and the
//! read side only needs "list all users"; both are traits so the consumer can be
//! tested against an in-memory registry.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryRegistry;
pub use postgres::PgRegistrar;
pub use r#trait::{Registrar, RegistrationError, UserDirectory};
