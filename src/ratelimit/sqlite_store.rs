//! SQLite-backed durable fallback store.
//!
//! Used only when the fast store cannot be reached. Each increment is one
//! `INSERT ... ON CONFLICT DO UPDATE ... RETURNING` statement: the row is
//! created, continued, or restarted (when its window has expired) atomically,
//! so concurrent requests can neither both insert nor both increment from the
//! same base.
//!
//! The same database keeps a block table so escalation still works while the
//! fast store is down. Block writes follow the same single-statement upsert
//! pattern and never extend a live block.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::backend::{BlockLedger, FallbackStore, WindowCount};
use super::clock;
use crate::error::{StoreError, StoreResult};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS rate_limit_counters (
    identifier TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    window_start INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    PRIMARY KEY (identifier, endpoint)
)";

const CREATE_EXPIRY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_rate_limit_counters_expires_at ON rate_limit_counters (expires_at)";

const CREATE_BLOCKS_TABLE: &str = "CREATE TABLE IF NOT EXISTS rate_limit_blocks (
    block_key TEXT PRIMARY KEY,
    block_until INTEGER NOT NULL
)";

const CREATE_BLOCKS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_rate_limit_blocks_block_until ON rate_limit_blocks (block_until)";

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// SET expressions see the pre-update row, so every CASE tests the old expiry.
const UPSERT_INCREMENT: &str = "INSERT INTO rate_limit_counters (identifier, endpoint, attempts, window_start, expires_at)
    VALUES (?1, ?2, 1, ?3, ?4)
    ON CONFLICT (identifier, endpoint) DO UPDATE SET
        attempts = CASE WHEN rate_limit_counters.expires_at > excluded.window_start
            THEN rate_limit_counters.attempts + 1 ELSE 1 END,
        window_start = CASE WHEN rate_limit_counters.expires_at > excluded.window_start
            THEN rate_limit_counters.window_start ELSE excluded.window_start END,
        expires_at = CASE WHEN rate_limit_counters.expires_at > excluded.window_start
            THEN rate_limit_counters.expires_at ELSE excluded.expires_at END
    RETURNING attempts, window_start, expires_at";

// A live block (?3 = now) is kept; an expired one is replaced.
const UPSERT_BLOCK: &str = "INSERT INTO rate_limit_blocks (block_key, block_until)
    VALUES (?1, ?2)
    ON CONFLICT (block_key) DO UPDATE SET
        block_until = CASE WHEN rate_limit_blocks.block_until > ?3
            THEN rate_limit_blocks.block_until ELSE excluded.block_until END
    RETURNING block_until";

/// Durable fallback counter and block tables on SQLite.
#[derive(Debug, Clone)]
pub struct SqliteFallbackStore {
    pool: SqlitePool,
}

impl SqliteFallbackStore {
    /// Connect to `url` (e.g. `sqlite://gatekeeper.db`) and create the table.
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool);
        store.migrate().await?;
        info!(url = %url, "Durable fallback store ready");
        Ok(store)
    }

    /// Wrap an existing pool. Call [`migrate`](Self::migrate) before use.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the counter and block tables and their expiry indexes if
    /// missing.
    pub async fn migrate(&self) -> StoreResult<()> {
        for statement in [
            CREATE_TABLE,
            CREATE_EXPIRY_INDEX,
            CREATE_BLOCKS_TABLE,
            CREATE_BLOCKS_INDEX,
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Attempts in the live row, or zero. Never writes.
    pub async fn attempts(
        &self,
        identifier: &str,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let row = sqlx::query(
            "SELECT attempts FROM rate_limit_counters
             WHERE identifier = ?1 AND endpoint = ?2 AND expires_at > ?3",
        )
        .bind(identifier)
        .bind(endpoint)
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => to_count(row.try_get("attempts")?),
            None => Ok(0),
        }
    }
}

fn to_count(value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative attempts: {}", value)))
}

fn to_time(ms: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", ms)))
}

#[async_trait]
impl FallbackStore for SqliteFallbackStore {
    async fn increment(
        &self,
        identifier: &str,
        endpoint: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<WindowCount> {
        let expires_at = clock::add(now, window);

        let row = sqlx::query(UPSERT_INCREMENT)
            .bind(identifier)
            .bind(endpoint)
            .bind(now.timestamp_millis())
            .bind(expires_at.timestamp_millis())
            .fetch_one(&self.pool)
            .await?;

        let count = WindowCount {
            attempts: to_count(row.try_get("attempts")?)?,
            window_start: to_time(row.try_get("window_start")?)?,
            reset_at: to_time(row.try_get("expires_at")?)?,
        };

        debug!(
            identifier = %identifier,
            endpoint = %endpoint,
            attempts = count.attempts,
            "Fallback counter incremented"
        );

        Ok(count)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM rate_limit_counters WHERE expires_at <= ?1")
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await?;
        debug!(removed = result.rows_affected(), "Purged expired fallback counters");
        Ok(result.rows_affected())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[async_trait]
impl BlockLedger for SqliteFallbackStore {
    async fn blocked_until(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT block_until FROM rate_limit_blocks WHERE block_key = ?1 AND block_until > ?2",
        )
        .bind(key)
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| to_time(row.try_get("block_until")?)).transpose()
    }

    async fn block(
        &self,
        key: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<DateTime<Utc>> {
        let row = sqlx::query(UPSERT_BLOCK)
            .bind(key)
            .bind(until.timestamp_millis())
            .bind(now.timestamp_millis())
            .fetch_one(&self.pool)
            .await?;
        let effective = to_time(row.try_get("block_until")?)?;
        debug!(key = %key, block_until = %effective, "Durable block recorded");
        Ok(effective)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM rate_limit_blocks WHERE block_until <= ?1")
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await?;
        debug!(removed = result.rows_affected(), "Purged expired durable blocks");
        Ok(result.rows_affected())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
