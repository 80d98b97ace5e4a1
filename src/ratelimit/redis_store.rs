//! Redis-backed fast counter store and block ledger.
//!
//! Counters and blocks are shared by every server instance. Each operation is
//! a single Lua script, so the increment, the expiry, and the read-back happen
//! atomically on the server:
//!
//! - counters: `INCR` + `PEXPIRE` on the first hit of a window + `PTTL`
//! - blocks: `SET NX PX` (never extends a live block) falling back to `GET`
//!
//! The connection is established lazily and retried on the next call after a
//! failure, so a Redis outage at startup does not prevent the service from
//! starting; the engine falls back to the durable store instead.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::fmt;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::backend::{BlockLedger, CounterStore, WindowCount};
use super::clock;
use crate::error::{StoreError, StoreResult};

const INCREMENT_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {current, ttl}
"#;

const BLOCK_SCRIPT: &str = r#"
local set = redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2])
if set then
    return tonumber(ARGV[1])
end
return tonumber(redis.call('GET', KEYS[1]))
"#;

/// Configuration for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix for every key written (default: "gatekeeper:")
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "gatekeeper:".to_string(),
        }
    }
}

/// Redis fast counter store and block ledger.
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    config: RedisStoreConfig,
    increment_script: Script,
    block_script: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .field("connected", &self.connection.initialized())
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Create a store for `url`. No connection is made until first use.
    ///
    /// # Errors
    /// Returns an error if the URL is malformed.
    pub fn open(url: &str, config: RedisStoreConfig) -> StoreResult<Self> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            config,
            increment_script: Script::new(INCREMENT_SCRIPT),
            block_script: Script::new(BLOCK_SCRIPT),
        })
    }

    /// Create a store and connect eagerly.
    pub async fn connect(url: &str, config: RedisStoreConfig) -> StoreResult<Self> {
        let store = Self::open(url, config)?;
        store.connection().await?;
        Ok(store)
    }

    async fn connection(&self) -> StoreResult<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone()).await?;
                info!(prefix = %self.config.key_prefix, "Connected to Redis");
                Ok::<_, StoreError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }

    fn counter_key(&self, key: &str) -> String {
        format!("{}rl:{}", self.config.key_prefix, key)
    }

    fn block_key(&self, key: &str) -> String {
        format!("{}block:{}", self.config.key_prefix, key)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", ms)))
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<WindowCount> {
        let mut conn = self.connection().await?;
        let redis_key = self.counter_key(key);

        let (attempts, ttl_ms): (i64, i64) = self
            .increment_script
            .key(&redis_key)
            .arg(millis(window))
            .invoke_async(&mut conn)
            .await?;

        let attempts = u64::try_from(attempts)
            .map_err(|_| StoreError::Corrupt(format!("negative counter for {}", redis_key)))?;
        let ttl = Duration::from_millis(ttl_ms.max(0) as u64);
        let reset_at = clock::add(now, ttl);
        let elapsed = window.saturating_sub(ttl);
        let window_start = chrono::Duration::from_std(elapsed)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(now);

        debug!(key = %redis_key, attempts, ttl_ms, "Redis counter incremented");

        Ok(WindowCount {
            attempts,
            window_start,
            reset_at,
        })
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[async_trait]
impl BlockLedger for RedisStore {
    async fn blocked_until(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let mut conn = self.connection().await?;
        let value: Option<i64> = redis::cmd("GET")
            .arg(self.block_key(key))
            .query_async(&mut conn)
            .await?;

        match value {
            Some(ms) => {
                let until = from_millis(ms)?;
                Ok((until > now).then_some(until))
            }
            None => Ok(None),
        }
    }

    async fn block(
        &self,
        key: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<DateTime<Utc>> {
        let mut conn = self.connection().await?;
        let ttl_ms = (until - now).num_milliseconds().max(1);

        let effective: i64 = self
            .block_script
            .key(self.block_key(key))
            .arg(until.timestamp_millis())
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        from_millis(effective)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REDIS_URL: &str = "redis://127.0.0.1/";

    async fn test_store(test_name: &str) -> Option<RedisStore> {
        let config = RedisStoreConfig {
            key_prefix: format!("gatekeeper-test:{}:{}:", test_name, uuid::Uuid::new_v4()),
        };
        match RedisStore::connect(REDIS_URL, config).await {
            Ok(store) => Some(store),
            Err(_) => {
                eprintln!("Skipping test: Redis not available at {}", REDIS_URL);
                None
            }
        }
    }

    #[test]
    fn test_key_prefixing() {
        let store = RedisStore::open(REDIS_URL, RedisStoreConfig::default()).unwrap();
        assert_eq!(store.counter_key("ip:1.2.3.4:auth"), "gatekeeper:rl:ip:1.2.3.4:auth");
        assert_eq!(store.block_key("ip:1.2.3.4:auth"), "gatekeeper:block:ip:1.2.3.4:auth");
    }

    #[test]
    fn test_open_rejects_bad_url() {
        assert!(RedisStore::open("not a url", RedisStoreConfig::default()).is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_increment() {
        let Some(store) = test_store("increment").await else {
            return;
        };
        let now = Utc::now();
        let window = Duration::from_secs(60);

        for expected in 1..=3 {
            let count = CounterStore::increment(&store, "k", window, now).await.unwrap();
            assert_eq!(count.attempts, expected);
            assert!(count.reset_at > now);
            assert!(count.reset_at <= now + chrono::Duration::seconds(60));
        }
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_window_expires() {
        let Some(store) = test_store("expiry").await else {
            return;
        };
        let window = Duration::from_millis(200);

        CounterStore::increment(&store, "k", window, Utc::now()).await.unwrap();
        CounterStore::increment(&store, "k", window, Utc::now()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let count = CounterStore::increment(&store, "k", window, Utc::now()).await.unwrap();
        assert_eq!(count.attempts, 1);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_block_does_not_stack() {
        let Some(store) = test_store("block").await else {
            return;
        };
        let now = Utc::now();
        let first = now + chrono::Duration::minutes(30);
        let second = now + chrono::Duration::minutes(60);

        let set = store.block("k", first, now).await.unwrap();
        assert_eq!(set.timestamp_millis(), first.timestamp_millis());

        let kept = store.block("k", second, now).await.unwrap();
        assert_eq!(kept.timestamp_millis(), first.timestamp_millis());

        let until = store.blocked_until("k", now).await.unwrap().unwrap();
        assert_eq!(until.timestamp_millis(), first.timestamp_millis());
        assert!(store.blocked_until("other", now).await.unwrap().is_none());
    }
}
