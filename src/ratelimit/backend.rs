//! Store ports for counters and blocks.
//!
//! The decision engine only talks to these traits. Implementations are shared,
//! externally hosted state (Redis, SQL) or the in-process stores used for
//! single-node deployments and tests. Every mutation must be atomic at the
//! store: the engine holds no locks of its own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::StoreResult;

/// State of a counter window right after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Attempts recorded in the current window, including this one
    pub attempts: u64,
    /// When the current window started
    pub window_start: DateTime<Utc>,
    /// When the current window expires
    pub reset_at: DateTime<Utc>,
}

/// The fast, shared fixed-window counter.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically count one attempt under `key` and return the window state.
    ///
    /// The first attempt opens a window of length `window`; later attempts
    /// within it accumulate; the first attempt after expiry opens a new one.
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<WindowCount>;

    /// Drop windows that expired at or before `now`, returning how many were
    /// removed. Stores with native expiry keep the default.
    async fn purge_expired(&self, _now: DateTime<Utc>) -> StoreResult<u64> {
        Ok(0)
    }

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// The durable counter table used when the fast store is unavailable.
#[async_trait]
pub trait FallbackStore: Send + Sync {
    /// Atomically upsert-increment the live `(identifier, endpoint)` row.
    ///
    /// A row whose window has expired is restarted at `attempts = 1`, never
    /// continued.
    async fn increment(
        &self,
        identifier: &str,
        endpoint: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<WindowCount>;

    /// Drop rows that expired at or before `now`, returning how many were
    /// removed.
    async fn purge_expired(&self, _now: DateTime<Utc>) -> StoreResult<u64> {
        Ok(0)
    }

    fn name(&self) -> &'static str;
}

/// Tracks identifiers under an escalated temporary block.
#[async_trait]
pub trait BlockLedger: Send + Sync {
    /// The block expiry for `key`, or `None` when not blocked.
    ///
    /// Entries with `block_until <= now` are treated as absent.
    async fn blocked_until(&self, key: &str, now: DateTime<Utc>) -> StoreResult<Option<DateTime<Utc>>>;

    /// Block `key` until `until` unless a live block already exists.
    ///
    /// Returns the expiry of the block in force afterwards; an existing block
    /// is never extended.
    async fn block(
        &self,
        key: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<DateTime<Utc>>;

    /// Drop blocks that expired at or before `now`, returning how many were
    /// removed.
    async fn purge_expired(&self, _now: DateTime<Utc>) -> StoreResult<u64> {
        Ok(0)
    }

    fn name(&self) -> &'static str;
}
