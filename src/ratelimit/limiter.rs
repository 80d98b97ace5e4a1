//! The decision engine.
//!
//! [`RateLimiter::check`] runs, in order: config resolution, bypass checks,
//! the block ledger, counting (fast store, else durable fallback, else the
//! failure policy), block escalation, and result assembly. It never fails:
//! every store error is absorbed and reported through `degraded`.
//!
//! Blocks are read from and written to the primary ledger. When it fails and
//! a fallback ledger is configured, that ledger serves instead, so escalation
//! keeps holding through a fast-store outage.
//!
//! The engine holds no lock around a decision. Correctness under concurrent
//! requests, across any number of instances, comes from the stores' atomic
//! increments.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use super::backend::{BlockLedger, CounterStore, FallbackStore, WindowCount};
use super::bypass::{Bypass, BypassPolicy};
use super::clock::{self, Clock, SystemClock};
use super::context::{Identifier, RateLimitContext};
use super::counter::{MemoryBlockLedger, MemoryCounterStore};
use super::events::{EventSink, TracingEventSink, ViolationEvent, ViolationType};
use super::result::{Degraded, RateLimitResult};
use super::rules::{RateLimitConfig, RateLimitRule, RuleCatalog, RuleMode};
use crate::error::{StoreError, StoreResult};

/// Reset horizon reported for bypassed requests.
const BYPASS_RESET: Duration = Duration::from_secs(60);
/// Retry-After given when failing closed without any window information.
const FAIL_CLOSED_RETRY: Duration = Duration::from_secs(60);

/// What to do when no store can count a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request; a limiter outage must not become a service outage.
    #[default]
    Open,
    /// Reject the request.
    Closed,
}

/// Tunables for the decision engine.
#[derive(Debug, Clone)]
pub struct LimiterOptions {
    /// Upper bound on every store call
    pub store_timeout: Duration,
    /// How multiple rules in one config combine
    pub rule_mode: RuleMode,
    /// Decision when both counter paths fail
    pub failure_policy: FailurePolicy,
    /// After a fast-store failure, go straight to the fallback for this long
    pub fast_store_cooldown: Duration,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_millis(250),
            rule_mode: RuleMode::All,
            failure_policy: FailurePolicy::Open,
            fast_store_cooldown: Duration::ZERO,
        }
    }
}

/// Counting result for one rule.
#[derive(Debug, Clone, Copy)]
struct RuleOutcome {
    index: usize,
    rule: RateLimitRule,
    count: WindowCount,
}

impl RuleOutcome {
    fn passed(&self) -> bool {
        self.count.attempts <= self.rule.requests_allowed()
    }

    fn remaining(&self) -> u64 {
        self.rule.requests_allowed().saturating_sub(self.count.attempts)
    }
}

/// The admission and abuse-mitigation engine.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct RateLimiter {
    catalog: RuleCatalog,
    counters: Arc<dyn CounterStore>,
    fallback: Option<Arc<dyn FallbackStore>>,
    blocks: Arc<dyn BlockLedger>,
    fallback_blocks: Option<Arc<dyn BlockLedger>>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    bypass: BypassPolicy,
    options: LimiterOptions,
    /// Epoch millis before which the fast store is skipped
    fast_store_retry_at: AtomicI64,
}

impl RateLimiter {
    /// Create an engine over a fast counter store and a block ledger.
    pub fn new(
        catalog: RuleCatalog,
        counters: Arc<dyn CounterStore>,
        blocks: Arc<dyn BlockLedger>,
    ) -> Self {
        Self {
            catalog,
            counters,
            fallback: None,
            blocks,
            fallback_blocks: None,
            sink: Arc::new(TracingEventSink),
            clock: Arc::new(SystemClock),
            bypass: BypassPolicy::default(),
            options: LimiterOptions::default(),
            fast_store_retry_at: AtomicI64::new(i64::MIN),
        }
    }

    /// An engine over in-process stores, for single-node use.
    pub fn in_memory(catalog: RuleCatalog) -> Self {
        Self::new(
            catalog,
            Arc::new(MemoryCounterStore::new()),
            Arc::new(MemoryBlockLedger::new()),
        )
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackStore>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Ledger used when the primary block ledger fails.
    pub fn with_fallback_blocks(mut self, blocks: Arc<dyn BlockLedger>) -> Self {
        self.fallback_blocks = Some(blocks);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_bypass(mut self, bypass: BypassPolicy) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn with_options(mut self, options: LimiterOptions) -> Self {
        self.options = options;
        self
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    pub fn options(&self) -> &LimiterOptions {
        &self.options
    }

    /// Decide whether to admit a request.
    ///
    /// `config_key` is resolved through the catalog with the caller's role
    /// unless `override_config` is given.
    pub async fn check(
        &self,
        context: &RateLimitContext,
        config_key: &str,
        override_config: Option<&RateLimitConfig>,
    ) -> RateLimitResult {
        let now = self.clock.now();
        let config = match override_config {
            Some(config) => config.clone(),
            None => self.catalog.resolve(config_key, context.role),
        };

        trace!(
            key = %config.key(),
            ip = %context.ip(),
            endpoint = %context.endpoint,
            "Checking rate limit"
        );

        match self.bypass.evaluate(context) {
            Some(Bypass::Whitelist) => {
                trace!(ip = %context.ip(), "Whitelisted address, skipping rate limit");
                return RateLimitResult::unlimited(clock::add(now, BYPASS_RESET));
            }
            Some(Bypass::Emergency) => {
                let identifier = Identifier::from_context(context);
                self.emit(ViolationEvent::new(
                    context,
                    &identifier,
                    config.key(),
                    ViolationType::EmergencyBypass,
                    true,
                    serde_json::json!({ "degraded": Degraded::EmergencyBypass.as_str() }),
                    now,
                ));
                return RateLimitResult::unlimited(clock::add(now, BYPASS_RESET))
                    .with_degraded(Degraded::EmergencyBypass);
            }
            None => {}
        }

        let identifier = Identifier::from_context(context);
        let block_key = identifier.block_key(config.key());

        match self.blocked_until(&block_key, now).await {
            Ok((Some(until), degraded)) => {
                debug!(identifier = %identifier, key = %config.key(), block_until = %until, "Request rejected by active block");
                self.emit(ViolationEvent::new(
                    context,
                    &identifier,
                    config.key(),
                    ViolationType::Blocked,
                    false,
                    serde_json::json!({ "blockUntil": until }),
                    now,
                ));
                return RateLimitResult {
                    allowed: false,
                    limit: config.primary().requests_allowed(),
                    remaining: 0,
                    reset_at: until,
                    blocked: true,
                    block_until: Some(until),
                    retry_after_seconds: Some(clock::seconds_until(now, until)),
                    degraded,
                };
            }
            Ok((None, _)) => {}
            Err(e) => {
                warn!(
                    ledger = self.blocks.name(),
                    error = %e,
                    "Block ledger unavailable, treating identifier as unblocked"
                );
            }
        }

        let counted = join_all(
            config
                .rules()
                .iter()
                .enumerate()
                .map(|(index, rule)| self.count(&identifier, config.key(), index, rule, now)),
        )
        .await;

        let mut outcomes = Vec::with_capacity(config.rules().len());
        let mut degraded = None;
        for (index, (rule, counted)) in config.rules().iter().zip(counted).enumerate() {
            match counted {
                Some((count, path)) => {
                    degraded = degraded.or(path);
                    outcomes.push(RuleOutcome {
                        index,
                        rule: *rule,
                        count,
                    });
                }
                None => return self.storage_unavailable(context, &identifier, &config, now),
            }
        }

        self.decide(context, &identifier, &config, &outcomes, degraded, now)
            .await
    }

    /// The active block for a caller, without counting or mutating anything.
    pub async fn block_status(
        &self,
        context: &RateLimitContext,
        config_key: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let config = self.catalog.resolve(config_key, context.role);
        let identifier = Identifier::from_context(context);
        let (until, _) = self
            .blocked_until(&identifier.block_key(config.key()), self.clock.now())
            .await?;
        Ok(until)
    }

    /// Drop expired counters and blocks from every store, returning how many
    /// entries were removed. Failures are logged and skipped.
    pub async fn purge_expired(&self) -> u64 {
        let now = self.clock.now();
        let mut purged = vec![(self.counters.name(), self.counters.purge_expired(now).await)];
        if let Some(fallback) = &self.fallback {
            purged.push((fallback.name(), fallback.purge_expired(now).await));
        }
        purged.push((self.blocks.name(), self.blocks.purge_expired(now).await));
        if let Some(blocks) = &self.fallback_blocks {
            purged.push((blocks.name(), blocks.purge_expired(now).await));
        }

        let mut removed = 0;
        for (store, result) in purged {
            match result {
                Ok(count) => removed += count,
                Err(e) => warn!(store, error = %e, "Failed to purge expired entries"),
            }
        }
        debug!(removed, "Expired entries purged");
        removed
    }

    /// Run [`purge_expired`](Self::purge_expired) every `period` until the
    /// limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        info!(period_secs = period.as_secs_f64(), "Starting expired entry sweeper");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    debug!("Rate limiter dropped, stopping sweeper");
                    break;
                };
                limiter.purge_expired().await;
            }
        })
    }

    /// Active block for `key`: the primary ledger, else the fallback ledger.
    ///
    /// A block found through the fallback reports
    /// [`Degraded::DurableFallback`].
    async fn blocked_until(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<(Option<DateTime<Utc>>, Option<Degraded>)> {
        let primary_error = match self.timed(self.blocks.blocked_until(key, now)).await {
            Ok(until) => return Ok((until, None)),
            Err(e) => e,
        };
        let Some(fallback) = &self.fallback_blocks else {
            return Err(primary_error);
        };
        warn!(
            ledger = self.blocks.name(),
            error = %primary_error,
            "Block ledger unavailable, reading fallback ledger"
        );
        let until = self.timed(fallback.blocked_until(key, now)).await?;
        Ok((until, Some(Degraded::DurableFallback)))
    }

    /// Count one attempt against a rule: fast store, else durable fallback.
    ///
    /// Returns `None` when neither path answered.
    async fn count(
        &self,
        identifier: &Identifier,
        config_key: &str,
        index: usize,
        rule: &RateLimitRule,
        now: DateTime<Utc>,
    ) -> Option<(WindowCount, Option<Degraded>)> {
        let now_ms = now.timestamp_millis();
        if now_ms >= self.fast_store_retry_at.load(Ordering::Relaxed) {
            let counter_key = identifier.counter_key(config_key, index);
            match self
                .timed(self.counters.increment(&counter_key, rule.window(), now))
                .await
            {
                Ok(count) => return Some((count, None)),
                Err(e) => {
                    warn!(
                        store = self.counters.name(),
                        key = %counter_key,
                        error = %e,
                        "Fast counter store failed, falling back to durable store"
                    );
                    self.trip_fast_store(now);
                }
            }
        }

        let fallback = self.fallback.as_ref()?;
        let endpoint = if index == 0 {
            config_key.to_string()
        } else {
            format!("{}#{}", config_key, index)
        };
        match self
            .timed(fallback.increment(identifier.as_str(), &endpoint, rule.window(), now))
            .await
        {
            Ok(count) => Some((count, Some(Degraded::DurableFallback))),
            Err(e) => {
                error!(
                    store = fallback.name(),
                    identifier = %identifier,
                    endpoint = %endpoint,
                    error = %e,
                    "Durable fallback store failed"
                );
                None
            }
        }
    }

    fn trip_fast_store(&self, now: DateTime<Utc>) {
        if self.options.fast_store_cooldown.is_zero() {
            return;
        }
        let retry_at = clock::add(now, self.options.fast_store_cooldown);
        self.fast_store_retry_at
            .store(retry_at.timestamp_millis(), Ordering::Relaxed);
    }

    async fn decide(
        &self,
        context: &RateLimitContext,
        identifier: &Identifier,
        config: &RateLimitConfig,
        outcomes: &[RuleOutcome],
        degraded: Option<Degraded>,
        now: DateTime<Utc>,
    ) -> RateLimitResult {
        let allowed = match self.options.rule_mode {
            RuleMode::All => outcomes.iter().all(RuleOutcome::passed),
            RuleMode::Any => outcomes.iter().any(RuleOutcome::passed),
        };

        if allowed {
            // All: the tightest passing rule. Any: the loosest passing rule.
            let passing = outcomes.iter().filter(|o| o.passed());
            let reported = match self.options.rule_mode {
                RuleMode::All => passing.min_by_key(|o| o.remaining()),
                RuleMode::Any => passing.max_by_key(|o| o.remaining()),
            };
            let Some(outcome) = reported else {
                return self.storage_unavailable(context, identifier, config, now);
            };
            return RateLimitResult {
                allowed: true,
                limit: outcome.rule.requests_allowed(),
                remaining: outcome.remaining(),
                reset_at: outcome.count.reset_at,
                blocked: false,
                block_until: None,
                retry_after_seconds: None,
                degraded,
            };
        }

        // All: wait for the last failing rule. Any: the first one to reset.
        let failing = outcomes.iter().filter(|o| !o.passed());
        let reported = match self.options.rule_mode {
            RuleMode::All => failing.max_by_key(|o| o.count.reset_at),
            RuleMode::Any => failing.min_by_key(|o| o.count.reset_at),
        };
        let Some(outcome) = reported else {
            return self.storage_unavailable(context, identifier, config, now);
        };

        debug!(
            identifier = %identifier,
            key = %config.key(),
            rule = outcome.index,
            attempts = outcome.count.attempts,
            limit = outcome.rule.requests_allowed(),
            "Rate limit exceeded"
        );

        self.emit(ViolationEvent::new(
            context,
            identifier,
            config.key(),
            ViolationType::Exceeded,
            false,
            serde_json::json!({
                "attempts": outcome.count.attempts,
                "limit": outcome.rule.requests_allowed(),
                "windowSecs": outcome.rule.window().as_secs(),
                "rule": outcome.index,
                "resetAt": outcome.count.reset_at,
                "degraded": degraded.map(|d| d.as_str()),
            }),
            now,
        ));

        if let Some(duration) = config.block_duration() {
            self.escalate(identifier, config, duration, now).await;
        }

        RateLimitResult {
            allowed: false,
            limit: outcome.rule.requests_allowed(),
            remaining: 0,
            reset_at: outcome.count.reset_at,
            blocked: false,
            block_until: None,
            retry_after_seconds: Some(clock::seconds_until(now, outcome.count.reset_at)),
            degraded,
        }
    }

    /// Put the caller in the penalty box on the first ledger that takes the
    /// write. An existing block is kept as is.
    async fn escalate(
        &self,
        identifier: &Identifier,
        config: &RateLimitConfig,
        duration: Duration,
        now: DateTime<Utc>,
    ) {
        let until = clock::add(now, duration);
        let block_key = identifier.block_key(config.key());
        let ledgers = std::iter::once(&self.blocks).chain(self.fallback_blocks.as_ref());
        for ledger in ledgers {
            match self.timed(ledger.block(&block_key, until, now)).await {
                Ok(effective) => {
                    debug!(identifier = %identifier, key = %config.key(), ledger = ledger.name(), block_until = %effective, "Block in force");
                    return;
                }
                Err(e) => {
                    warn!(
                        ledger = ledger.name(),
                        identifier = %identifier,
                        error = %e,
                        "Failed to record block"
                    );
                }
            }
        }
    }

    fn storage_unavailable(
        &self,
        context: &RateLimitContext,
        identifier: &Identifier,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> RateLimitResult {
        let allowed = self.options.failure_policy == FailurePolicy::Open;
        error!(
            identifier = %identifier,
            key = %config.key(),
            policy = ?self.options.failure_policy,
            "No counter store available"
        );
        self.emit(ViolationEvent::new(
            context,
            identifier,
            config.key(),
            ViolationType::StorageUnavailable,
            allowed,
            serde_json::json!({
                "policy": self.options.failure_policy,
                "degraded": Degraded::StorageUnavailable.as_str(),
            }),
            now,
        ));

        let primary = config.primary();
        if allowed {
            RateLimitResult {
                allowed: true,
                limit: primary.requests_allowed(),
                remaining: primary.requests_allowed(),
                reset_at: clock::add(now, primary.window()),
                blocked: false,
                block_until: None,
                retry_after_seconds: None,
                degraded: Some(Degraded::StorageUnavailable),
            }
        } else {
            let reset_at = clock::add(now, FAIL_CLOSED_RETRY);
            RateLimitResult {
                allowed: false,
                limit: primary.requests_allowed(),
                remaining: 0,
                reset_at,
                blocked: false,
                block_until: None,
                retry_after_seconds: Some(FAIL_CLOSED_RETRY.as_secs()),
                degraded: Some(Degraded::StorageUnavailable),
            }
        }
    }

    fn emit(&self, event: ViolationEvent) {
        let action = event.action;
        if let Err(e) = self.sink.emit(event) {
            error!(action = action.as_str(), error = %e, "Failed to emit violation event");
        }
    }

    async fn timed<T>(&self, call: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        match tokio::time::timeout(self.options.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.options.store_timeout)),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("counters", &self.counters.name())
            .field("fallback", &self.fallback.as_ref().map(|f| f.name()))
            .field("blocks", &self.blocks.name())
            .field("fallback_blocks", &self.fallback_blocks.as_ref().map(|b| b.name()))
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
