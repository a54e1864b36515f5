//! Storage traits and their Postgres, Redis and in-memory implementations.

use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, Result};

pub mod consent;
pub mod memory;
pub mod permission;
pub mod rate_limit;
pub mod security_event;
pub mod session;

pub use consent::ConsentStore;
pub use memory::MemoryStore;
pub use permission::PermissionStore;
pub use rate_limit::RateLimitStore;
pub use security_event::SecurityEventStore;
pub use session::SessionStore;

/// Runs a store call under a deadline. Running out of time is `StoreUnavailable`.
pub async fn bounded<T, F>(limit: Duration, what: &'static str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(AppError::StoreUnavailable(format!(
            "{} timed out after {}ms",
            what,
            limit.as_millis()
        ))),
    }
}

/// Reads a column, mapping any failure to `MissingData`.
pub(crate) fn column<'a, T>(row: &'a tokio_postgres::Row, name: &str) -> Result<T>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get(name)
        .map_err(|_| AppError::MissingData(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn slow_call_becomes_store_unavailable() {
        let result: Result<()> = bounded(Duration::from_millis(50), "slow read", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(AppError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn fast_call_passes_through() {
        let result = bounded(Duration::from_secs(1), "fast read", async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
