//! In-process counter and block stores.
//!
//! These back single-node deployments (`--memory`) and tests. Each key lives
//! in a [`DashMap`] shard and is updated under that shard's lock, which gives
//! the same atomic increment-and-get the shared stores provide.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;
use tracing::debug;

use super::backend::{BlockLedger, CounterStore, FallbackStore, WindowCount};
use super::clock;
use crate::error::StoreResult;

/// A counter window anchored at its first attempt.
#[derive(Debug, Clone, Copy)]
struct Window {
    attempts: u64,
    window_start: DateTime<Utc>,
    reset_at: DateTime<Utc>,
}

impl Window {
    fn open(window: Duration, now: DateTime<Utc>) -> Self {
        Self {
            attempts: 0,
            window_start: now,
            reset_at: clock::add(now, window),
        }
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.reset_at > now
    }

    fn count(&self) -> WindowCount {
        WindowCount {
            attempts: self.attempts,
            window_start: self.window_start,
            reset_at: self.reset_at,
        }
    }
}

/// In-memory counter store.
///
/// Implements both [`CounterStore`] and [`FallbackStore`]; the fallback rows
/// are kept apart from the fast counters.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    windows: DashMap<String, Window>,
    rows: DashMap<(String, String), Window>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts in the live window for `key`, or zero.
    pub fn current_count(&self, key: &str, now: DateTime<Utc>) -> u64 {
        self.windows
            .get(key)
            .filter(|w| w.is_live(now))
            .map(|w| w.attempts)
            .unwrap_or(0)
    }

    /// Attempts in the live fallback row, or zero.
    pub fn fallback_count(&self, identifier: &str, endpoint: &str, now: DateTime<Utc>) -> u64 {
        self.rows
            .get(&(identifier.to_string(), endpoint.to_string()))
            .filter(|w| w.is_live(now))
            .map(|w| w.attempts)
            .unwrap_or(0)
    }

    /// Number of tracked keys, live or not.
    pub fn counter_count(&self) -> usize {
        self.windows.len() + self.rows.len()
    }

    pub fn clear(&self) {
        self.windows.clear();
        self.rows.clear();
    }
}

/// Drop expired windows from `map`, returning how many were removed.
fn purge<K>(map: &DashMap<K, Window>, now: DateTime<Utc>) -> u64
where
    K: std::hash::Hash + Eq,
{
    let before = map.len();
    map.retain(|_, w| w.is_live(now));
    before.saturating_sub(map.len()) as u64
}

fn bump<K>(map: &DashMap<K, Window>, key: K, window: Duration, now: DateTime<Utc>) -> WindowCount
where
    K: std::hash::Hash + Eq,
{
    let mut entry = map.entry(key).or_insert_with(|| Window::open(window, now));
    let state = entry.value_mut();
    if !state.is_live(now) {
        *state = Window::open(window, now);
    }
    state.attempts += 1;
    state.count()
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<WindowCount> {
        Ok(bump(&self.windows, key.to_string(), window, now))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let removed = purge(&self.windows, now);
        debug!(removed, remaining = self.windows.len(), "memory counter cleanup complete");
        Ok(removed)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl FallbackStore for MemoryCounterStore {
    async fn increment(
        &self,
        identifier: &str,
        endpoint: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<WindowCount> {
        Ok(bump(
            &self.rows,
            (identifier.to_string(), endpoint.to_string()),
            window,
            now,
        ))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let removed = purge(&self.rows, now);
        debug!(removed, remaining = self.rows.len(), "memory fallback cleanup complete");
        Ok(removed)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// In-memory block ledger.
///
/// Expired entries read as absent and stay in the map until
/// [`BlockLedger::purge_expired`] runs.
#[derive(Debug, Default)]
pub struct MemoryBlockLedger {
    blocks: DashMap<String, DateTime<Utc>>,
}

impl MemoryBlockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[async_trait]
impl BlockLedger for MemoryBlockLedger {
    async fn blocked_until(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self
            .blocks
            .get(key)
            .map(|until| *until)
            .filter(|until| *until > now))
    }

    async fn block(
        &self,
        key: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<DateTime<Utc>> {
        let mut entry = self.blocks.entry(key.to_string()).or_insert(until);
        if *entry.value() <= now {
            *entry.value_mut() = until;
        }
        Ok(*entry.value())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let before = self.blocks.len();
        self.blocks.retain(|_, until| *until > now);
        let removed = before.saturating_sub(self.blocks.len()) as u64;
        debug!(removed, remaining = self.blocks.len(), "memory block cleanup complete");
        Ok(removed)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
