use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;

use crate::error::Result;

/// Counter state after one hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Hits in the current window, including this one.
    pub count: u64,
    /// Time until the window resets.
    pub resets_in: Duration,
}

/// Fixed-window hit counters keyed by `class:identity`.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically records one hit. The window starts at the first hit.
    async fn hit(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<WindowCount>;
}

/// Redis counters shared by every instance.
#[derive(Clone)]
pub struct RedisRateLimitStore {
    redis: ConnectionManager,
}

impl RedisRateLimitStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn hit(&self, key: &str, window: Duration, _now: DateTime<Utc>) -> Result<WindowCount> {
        let window_ms = window.as_millis().max(1) as u64;
        let key = format!("rate_limit:{}", key);

        // PEXPIRE NX only arms the TTL on the first hit of a window.
        let (count, ttl_ms): (u64, i64) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(&key)
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(window_ms)
            .arg("NX")
            .ignore()
            .cmd("PTTL")
            .arg(&key)
            .query_async(&mut self.redis.clone())
            .await?;

        let resets_in = if ttl_ms > 0 {
            Duration::from_millis(ttl_ms as u64)
        } else {
            window
        };

        Ok(WindowCount { count, resets_in })
    }
}

/// Process-local counters, for single-node deployments and tests.
///
/// Expired windows are swept at most once a minute.
#[derive(Clone, Default)]
pub struct MemoryRateLimitStore {
    windows: Arc<Mutex<Windows>>,
}

#[derive(Default)]
struct Windows {
    open: HashMap<String, (u64, DateTime<Utc>)>,
    swept_at: Option<DateTime<Utc>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a window still held in memory.
    pub async fn open_windows(&self) -> usize {
        self.windows.lock().await.open.len()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn hit(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<WindowCount> {
        let window_len = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let mut windows = self.windows.lock().await;

        if windows.swept_at.is_none_or(|at| now - at >= chrono::Duration::minutes(1)) {
            windows.open.retain(|_, (_, resets_at)| now < *resets_at);
            windows.swept_at = Some(now);
        }

        let entry = windows
            .open
            .entry(key.to_string())
            .or_insert((0, now + window_len));
        if now >= entry.1 {
            *entry = (0, now + window_len);
        }
        entry.0 += 1;

        let resets_in = (entry.1 - now).to_std().unwrap_or_default();
        Ok(WindowCount {
            count: entry.0,
            resets_in,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_within_window_and_resets_after() {
        let store = MemoryRateLimitStore::new();
        let start = Utc::now();
        let window = Duration::from_secs(60);

        assert_eq!(store.hit("login:1.2.3.4", window, start).await.unwrap().count, 1);
        let second = store
            .hit("login:1.2.3.4", window, start + chrono::Duration::seconds(20))
            .await
            .unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(second.resets_in, Duration::from_secs(40));

        let after = store
            .hit("login:1.2.3.4", window, start + chrono::Duration::seconds(61))
            .await
            .unwrap();
        assert_eq!(after.count, 1);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let store = MemoryRateLimitStore::new();
        let now = Utc::now();
        let window = Duration::from_secs(60);

        store.hit("login:a", window, now).await.unwrap();
        store.hit("login:a", window, now).await.unwrap();
        assert_eq!(store.hit("login:b", window, now).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn expired_windows_are_dropped() {
        let store = MemoryRateLimitStore::new();
        let now = Utc::now();
        let window = Duration::from_secs(60);

        for i in 0..1000 {
            store.hit(&format!("default:10.0.{}.{}", i / 256, i % 256), window, now).await.unwrap();
        }
        assert_eq!(store.open_windows().await, 1000);

        store
            .hit("default:10.9.9.9", window, now + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(store.open_windows().await, 1);
    }
}
