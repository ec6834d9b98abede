use redis::Client;
use redis::aio::ConnectionManager;

use crate::error::AppError;

/// Create a Redis connection manager for async operations.
///
/// The connection is verified with a `PING` so an unreachable ledger store
/// fails startup instead of the first delivery.
pub async fn create_redis_pool(redis_url: &str) -> Result<ConnectionManager, AppError> {
    let client = Client::open(redis_url)
        .map_err(|e| AppError::LedgerConnection(format!("invalid Redis URL: {e}")))?;
    let mut manager = ConnectionManager::new(client)
        .await
        .map_err(|e| AppError::LedgerConnection(format!("failed to connect to Redis: {e}")))?;

    let pong: String = redis::cmd("PING")
        .query_async(&mut manager)
        .await
        .map_err(|e| AppError::LedgerConnection(format!("Redis did not answer PING: {e}")))?;

    tracing::info!(reply = %pong, "Connected to Redis");
    Ok(manager)
}
