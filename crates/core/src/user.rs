//! Read-side records produced by a successful registration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::UserId;

/// Name stored for users created from queue registrations.
pub const DEFAULT_USER_NAME: &str = "John Doe";

/// Hotel payload stored alongside each registered user.
pub const DEFAULT_HOTEL_DATA: &str = "Sample Hotel Data";

/// A registered user (`users` row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}
