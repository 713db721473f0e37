//! Booking work item carried by the queue.
//!
//! Wire format (UTF-8 JSON):
//!
//! ```text
//! { "user_id": 7, "user_email": "a@example.com", "hotel_data": "..." }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// One booking request pulled off the queue.
///
/// Transient: it lives only from receipt until its batch has been flushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingMessage {
    pub user_id: i64,
    pub user_email: String,
    pub hotel_data: String,
}

impl BookingMessage {
    pub fn new(user_id: i64, user_email: impl Into<String>, hotel_data: impl Into<String>) -> Self {
        Self {
            user_id,
            user_email: user_email.into(),
            hotel_data: hotel_data.into(),
        }
    }

    /// Decode a delivery payload.
    ///
    /// Any failure here is permanent: the same bytes will never decode.
    pub fn from_payload(payload: &[u8]) -> DomainResult<Self> {
        serde_json::from_slice(payload).map_err(|e| DomainError::malformed(e.to_string()))
    }

    /// Encode as a delivery payload.
    pub fn to_payload(&self) -> Vec<u8> {
        // Serializing plain strings and integers cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}
