use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use bookingprocessor_core::User;

/// Registration operation error.
///
/// These are **infrastructure errors**; the consumer treats every variant the same
/// way (the whole batch is requeued), but logs and metrics keep them apart.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// The store refused the write (e.g. the email is already registered).
    #[error("registration rejected: {0}")]
    Rejected(String),

    /// The store could not be reached (pool closed or exhausted).
    #[error("registration store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),
}

/// Register one booking's user.
///
/// Implementations must be safe to call from every worker at once; any concurrency
/// limit (e.g. a connection pool) lives behind this trait.
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self, email: &str) -> Result<(), RegistrationError>;
}

/// Read side: list every registered user.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn list_users(&self) -> Result<Vec<User>, RegistrationError>;
}

#[async_trait]
impl<R> Registrar for Arc<R>
where
    R: Registrar + ?Sized,
{
    async fn register(&self, email: &str) -> Result<(), RegistrationError> {
        (**self).register(email).await
    }
}

#[async_trait]
impl<D> UserDirectory for Arc<D>
where
    D: UserDirectory + ?Sized,
{
    async fn list_users(&self) -> Result<Vec<User>, RegistrationError> {
        (**self).list_users().await
    }
}
