//! Postgres connection pool sized to this replica's share of the database.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

/// Connections are recycled after this long.
pub const MAX_CONNECTION_LIFETIME: Duration = Duration::from_secs(15 * 60);

/// Pool bounds for `max_connections` reserved connections.
///
/// Returns `(max, min)`; half the connections are kept warm.
pub fn pool_bounds(max_connections: u32) -> (u32, u32) {
    let max = max_connections.max(1);
    (max, max / 2)
}

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let (max, min) = pool_bounds(max_connections);
    let pool = PgPoolOptions::new()
        .max_connections(max)
        .min_connections(min)
        .max_lifetime(MAX_CONNECTION_LIFETIME)
        .connect(database_url)
        .await?;

    info!(max_connections = max, min_connections = min, "connected to postgres");
    Ok(pool)
}
