//! `bookingprocessor-core`: booking domain building blocks.
//!
//! This crate contains **pure domain** types (no queue, database or runtime concerns).

pub mod booking;
pub mod error;
pub mod id;
pub mod user;

pub use booking::BookingMessage;
pub use error::{DomainError, DomainResult};
pub use id::UserId;
pub use user::{DEFAULT_HOTEL_DATA, DEFAULT_USER_NAME, User};
