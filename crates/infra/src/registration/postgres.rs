//! Postgres-backed registration.
//!
//! One registration is one transaction: insert the user, insert a hotel row owned by
//! that user, commit. A failure at any step rolls the whole unit back (the open
//! transaction is rolled back when dropped).
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | RegistrationError |
//! |------------|----------------------|-------------------|
//! | Database (unique violation) | `23505` | `Rejected` |
//! | Database (foreign key / check violation) | `23503` / `23514` | `Rejected` |
//! | Database (other) | Any other | `Database` |
//! | PoolClosed / PoolTimedOut | N/A | `Unavailable` |
//! | Other | N/A | `Database` |
//!
//! Tables (`users`, `hotels`) are provisioned outside this crate.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use bookingprocessor_core::{DEFAULT_HOTEL_DATA, DEFAULT_USER_NAME, User, UserId};

use super::r#trait::{Registrar, RegistrationError, UserDirectory};

/// Postgres registration store.
///
/// Uses the SQLx connection pool, which is thread-safe; size the pool to the worker
/// count so every worker can hold a connection during its flush.
#[derive(Debug, Clone)]
pub struct PgRegistrar {
    pool: Arc<PgPool>,
}

impl PgRegistrar {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl Registrar for PgRegistrar {
    #[instrument(skip(self, email), err)]
    async fn register(&self, email: &str) -> Result<(), RegistrationError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let user_id: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO users (name, email)
            VALUES ($1, $2)
            RETURNING id
            "#,
        )
        .bind(DEFAULT_USER_NAME)
        .bind(email)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_user", e))?;

        sqlx::query(
            r#"
            INSERT INTO hotels (user_id, data)
            VALUES ($1, $2)
            "#,
        )
        .bind(user_id)
        .bind(DEFAULT_HOTEL_DATA)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_hotel", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

#[async_trait]
impl UserDirectory for PgRegistrar {
    #[instrument(skip(self), err)]
    async fn list_users(&self) -> Result<Vec<User>, RegistrationError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, email, created_at
            FROM users
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_users", e))?;

        rows.iter()
            .map(|row| {
                Ok(User {
                    id: UserId::new(i64::from(row.try_get::<i32, _>("id")?)),
                    name: row.try_get("name")?,
                    email: row.try_get("email")?,
                    created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| map_sqlx_error("decode_user_row", e))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RegistrationError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("23503") | Some("23514") => RegistrationError::Rejected(msg),
                _ => RegistrationError::Database(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            RegistrationError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            RegistrationError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        _ => RegistrationError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}
