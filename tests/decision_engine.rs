//! End-to-end behavior of the decision engine against in-process and
//! deliberately broken stores.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use gatekeeper::error::{StoreError, StoreResult};
use gatekeeper::ratelimit::{
    BlockLedger, BypassPolicy, Clock, CounterStore, Degraded, EmergencyToken, EventSink, FailurePolicy,
    FallbackStore, LimiterOptions, MemoryBlockLedger, MemoryCounterStore, MockClock,
    RateLimitConfig, RateLimitContext, RateLimitRule, RateLimiter, RuleCatalog, SinkError,
    SqliteFallbackStore, ViolationEvent, ViolationType, Whitelist, WindowCount, UNLIMITED,
};

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<ViolationEvent>>,
}

impl RecordingSink {
    fn actions(&self) -> Vec<ViolationType> {
        self.events.lock().iter().map(|e| e.action).collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: ViolationEvent) -> Result<(), SinkError> {
        self.events.lock().push(event);
        Ok(())
    }
}

struct ClosedSink;

impl EventSink for ClosedSink {
    fn emit(&self, _event: ViolationEvent) -> Result<(), SinkError> {
        Err(SinkError::Closed)
    }
}

/// Every call fails as if the backend were down.
struct FailingStore;

#[async_trait]
impl CounterStore for FailingStore {
    async fn increment(&self, _: &str, _: Duration, _: DateTime<Utc>) -> StoreResult<WindowCount> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

#[async_trait]
impl FallbackStore for FailingStore {
    async fn increment(
        &self,
        _: &str,
        _: &str,
        _: Duration,
        _: DateTime<Utc>,
    ) -> StoreResult<WindowCount> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

#[async_trait]
impl BlockLedger for FailingStore {
    async fn blocked_until(&self, _: &str, _: DateTime<Utc>) -> StoreResult<Option<DateTime<Utc>>> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn block(&self, _: &str, _: DateTime<Utc>, _: DateTime<Utc>) -> StoreResult<DateTime<Utc>> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

/// Never answers within any reasonable timeout.
struct SlowStore;

#[async_trait]
impl CounterStore for SlowStore {
    async fn increment(&self, _: &str, _: Duration, now: DateTime<Utc>) -> StoreResult<WindowCount> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(WindowCount {
            attempts: 1,
            window_start: now,
            reset_at: now,
        })
    }

    fn name(&self) -> &'static str {
        "slow"
    }
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn context() -> RateLimitContext {
    RateLimitContext::new("203.0.113.5", "/api/login").with_user_agent("integration-test")
}

#[tokio::test]
async fn test_login_abuse_scenario() {
    let clock = MockClock::new(start());
    let sink = Arc::new(RecordingSink::default());
    let limiter = RateLimiter::in_memory(RuleCatalog::builtin())
        .with_clock(Arc::new(clock.clone()))
        .with_event_sink(sink.clone());
    let ctx = context();

    for expected in [4, 3, 2, 1, 0] {
        let result = limiter.check(&ctx, "auth", None).await;
        assert!(result.allowed);
        assert_eq!(result.limit, 5);
        assert_eq!(result.remaining, expected);
        assert_eq!(result.reset_at, start() + chrono::Duration::minutes(15));
    }

    let sixth = limiter.check(&ctx, "auth", None).await;
    assert!(!sixth.allowed);
    assert!(!sixth.blocked);
    assert_eq!(sixth.remaining, 0);
    assert_eq!(sixth.retry_after_seconds, Some(15 * 60));

    clock.advance(Duration::from_secs(60));
    let seventh = limiter.check(&ctx, "auth", None).await;
    assert!(!seventh.allowed);
    assert!(seventh.blocked);
    assert_eq!(
        seventh.block_until,
        Some(start() + chrono::Duration::minutes(30))
    );
    assert_eq!(seventh.retry_after_seconds, Some(29 * 60));

    assert_eq!(
        sink.actions(),
        vec![ViolationType::Exceeded, ViolationType::Blocked]
    );
    let events = sink.events.lock();
    assert_eq!(events[0].identifier, "ip:203.0.113.5");
    assert_eq!(events[0].config_key, "auth");
    assert_eq!(events[0].user_agent, "integration-test");
    assert!(!events[0].success);
}

#[tokio::test]
async fn test_block_outlives_window_then_quota_refreshes() {
    let clock = MockClock::new(start());
    let limiter =
        RateLimiter::in_memory(RuleCatalog::builtin()).with_clock(Arc::new(clock.clone()));
    let ctx = context();

    for _ in 0..6 {
        limiter.check(&ctx, "auth", None).await;
    }

    // Window has rolled over but the block is still in force.
    clock.advance(Duration::from_secs(16 * 60));
    let during_block = limiter.check(&ctx, "auth", None).await;
    assert!(!during_block.allowed);
    assert!(during_block.blocked);

    clock.advance(Duration::from_secs(15 * 60));
    let after_block = limiter.check(&ctx, "auth", None).await;
    assert!(after_block.allowed);
    assert!(!after_block.blocked);
    assert_eq!(after_block.remaining, 4);
}

#[tokio::test]
async fn test_window_rollover_restores_full_quota() {
    let clock = MockClock::new(start());
    let limiter =
        RateLimiter::in_memory(RuleCatalog::builtin()).with_clock(Arc::new(clock.clone()));
    let config = RateLimitConfig::single("burst", 2, Duration::from_secs(10), None).unwrap();
    let ctx = context();

    assert!(limiter.check(&ctx, "burst", Some(&config)).await.allowed);
    assert!(limiter.check(&ctx, "burst", Some(&config)).await.allowed);
    let denied = limiter.check(&ctx, "burst", Some(&config)).await;
    assert!(!denied.allowed);
    assert!(!denied.blocked);

    clock.set(denied.reset_at);
    let fresh = limiter.check(&ctx, "burst", Some(&config)).await;
    assert!(fresh.allowed);
    assert_eq!(fresh.remaining, 1);
}

async fn admitted_under_contention(limiter: Arc<RateLimiter>, requests: usize) -> usize {
    let config = RateLimitConfig::single("race", 5, Duration::from_secs(60), None).unwrap();

    let checks = (0..requests).map(|_| {
        let limiter = limiter.clone();
        let config = config.clone();
        tokio::spawn(async move { limiter.check(&context(), "race", Some(&config)).await })
    });
    let results = join_all(checks).await;

    results
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|r| r.allowed)
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_admit_exactly_the_limit() {
    let limiter = Arc::new(RateLimiter::in_memory(RuleCatalog::builtin()));
    assert_eq!(admitted_under_contention(limiter, 6).await, 5);

    let limiter = Arc::new(RateLimiter::in_memory(RuleCatalog::builtin()));
    assert_eq!(admitted_under_contention(limiter, 40).await, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_on_shared_database_admit_exactly_the_limit() {
    let path = std::env::temp_dir().join(format!("gatekeeper-{}.db", uuid::Uuid::new_v4()));
    let url = format!("sqlite://{}", path.display());
    let fallback = Arc::new(SqliteFallbackStore::connect(&url, 4).await.unwrap());
    let limiter = Arc::new(
        RateLimiter::new(
            RuleCatalog::builtin(),
            Arc::new(FailingStore),
            Arc::new(MemoryBlockLedger::new()),
        )
        .with_fallback(fallback.clone()),
    );

    let admitted = admitted_under_contention(limiter, 20).await;
    fallback.close().await;
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
    }

    assert_eq!(admitted, 5);
}

#[tokio::test]
async fn test_all_rules_must_pass_by_default() {
    let clock = MockClock::new(start());
    let limiter =
        RateLimiter::in_memory(RuleCatalog::builtin()).with_clock(Arc::new(clock.clone()));
    let config = RateLimitConfig::new(
        "layered",
        vec![
            RateLimitRule::new(3, Duration::from_secs(10)).unwrap(),
            RateLimitRule::new(5, Duration::from_secs(60)).unwrap(),
        ],
        None,
    )
    .unwrap();
    let ctx = context();

    let first = limiter.check(&ctx, "layered", Some(&config)).await;
    assert_eq!((first.limit, first.remaining), (3, 2));
    limiter.check(&ctx, "layered", Some(&config)).await;
    limiter.check(&ctx, "layered", Some(&config)).await;

    let short_rule = limiter.check(&ctx, "layered", Some(&config)).await;
    assert!(!short_rule.allowed);
    assert_eq!(short_rule.retry_after_seconds, Some(10));

    clock.advance(Duration::from_secs(10));
    let last = limiter.check(&ctx, "layered", Some(&config)).await;
    assert!(last.allowed);
    assert_eq!((last.limit, last.remaining), (5, 0));

    let long_rule = limiter.check(&ctx, "layered", Some(&config)).await;
    assert!(!long_rule.allowed);
    assert_eq!(long_rule.limit, 5);
    assert_eq!(long_rule.retry_after_seconds, Some(50));
}

#[tokio::test]
async fn test_whitelisted_address_is_unlimited() {
    let sink = Arc::new(RecordingSink::default());
    let bypass = BypassPolicy::new(
        Whitelist::parse(&["203.0.113.0/24"]).unwrap(),
        EmergencyToken::default(),
    );
    let limiter = RateLimiter::in_memory(RuleCatalog::builtin())
        .with_bypass(bypass)
        .with_event_sink(sink.clone());

    for _ in 0..20 {
        let result = limiter.check(&context(), "auth", None).await;
        assert!(result.allowed);
        assert_eq!(result.limit, UNLIMITED);
        assert!(result.degraded.is_none());
    }
    assert!(sink.actions().is_empty());
}

#[tokio::test]
async fn test_emergency_bypass_is_audited() {
    let sink = Arc::new(RecordingSink::default());
    let bypass = BypassPolicy::new(
        Whitelist::default(),
        EmergencyToken::new(Some("break-glass")),
    );
    let limiter = RateLimiter::in_memory(RuleCatalog::builtin())
        .with_bypass(bypass)
        .with_event_sink(sink.clone());

    let result = limiter
        .check(&context().with_bypass_token("break-glass"), "admin", None)
        .await;
    assert!(result.allowed);
    assert_eq!(result.remaining, UNLIMITED);
    assert_eq!(result.degraded, Some(Degraded::EmergencyBypass));

    let wrong = limiter
        .check(&context().with_bypass_token("guess"), "admin", None)
        .await;
    assert!(wrong.allowed);
    assert_eq!(wrong.limit, 30);
    assert!(wrong.degraded.is_none());

    let events = sink.events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, ViolationType::EmergencyBypass);
    assert!(events[0].success);
}

#[tokio::test]
async fn test_fast_store_failure_uses_durable_fallback() {
    let fallback = Arc::new(MemoryCounterStore::new());
    let limiter = RateLimiter::new(
        RuleCatalog::builtin(),
        Arc::new(FailingStore),
        Arc::new(MemoryBlockLedger::new()),
    )
    .with_fallback(fallback.clone());
    let ctx = context();

    for expected in [4, 3, 2, 1, 0] {
        let result = limiter.check(&ctx, "auth", None).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, expected);
        assert_eq!(result.degraded, Some(Degraded::DurableFallback));
    }
    let denied = limiter.check(&ctx, "auth", None).await;
    assert!(!denied.allowed);
    assert_eq!(denied.degraded, Some(Degraded::DurableFallback));
    assert_eq!(fallback.fallback_count("ip:203.0.113.5", "auth", Utc::now()), 6);
}

#[tokio::test]
async fn test_sqlite_fallback_enforces_quota() {
    let clock = MockClock::new(start());
    let fallback = Arc::new(SqliteFallbackStore::connect("sqlite::memory:", 1).await.unwrap());
    let limiter = RateLimiter::new(
        RuleCatalog::builtin(),
        Arc::new(FailingStore),
        Arc::new(MemoryBlockLedger::new()),
    )
    .with_fallback(fallback.clone())
    .with_clock(Arc::new(clock.clone()));
    let ctx = context();

    for expected in [2, 1, 0] {
        let result = limiter.check(&ctx, "register", None).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, expected);
        assert_eq!(result.degraded, Some(Degraded::DurableFallback));
    }
    let denied = limiter.check(&ctx, "register", None).await;
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after_seconds, Some(60 * 60));
    assert_eq!(
        fallback
            .attempts("ip:203.0.113.5", "register", start())
            .await
            .unwrap(),
        4
    );
}

#[tokio::test]
async fn test_total_outage_fails_open() {
    let sink = Arc::new(RecordingSink::default());
    let limiter = RateLimiter::new(
        RuleCatalog::builtin(),
        Arc::new(FailingStore),
        Arc::new(FailingStore),
    )
    .with_fallback(Arc::new(FailingStore))
    .with_event_sink(sink.clone());

    let result = limiter.check(&context(), "auth", None).await;
    assert!(result.allowed);
    assert_eq!(result.degraded, Some(Degraded::StorageUnavailable));
    assert_eq!(sink.actions(), vec![ViolationType::StorageUnavailable]);
}

#[tokio::test]
async fn test_total_outage_with_override_reports_its_rule() {
    let clock = MockClock::new(start());
    let limiter = RateLimiter::new(
        RuleCatalog::builtin(),
        Arc::new(FailingStore),
        Arc::new(FailingStore),
    )
    .with_fallback(Arc::new(FailingStore))
    .with_clock(Arc::new(clock.clone()));

    // A rule-less override is rejected before it can reach the engine
    assert!(RateLimitConfig::new("export:csv", Vec::new(), None).is_err());

    let config = RateLimitConfig::single("export:csv", 2, Duration::from_secs(60), None).unwrap();
    let result = limiter.check(&context(), "export", Some(&config)).await;
    assert!(result.allowed);
    assert_eq!((result.limit, result.remaining), (2, 2));
    assert_eq!(result.reset_at, start() + chrono::Duration::seconds(60));
    assert_eq!(result.degraded, Some(Degraded::StorageUnavailable));
}

#[tokio::test]
async fn test_blocks_hold_through_fast_store_outage() {
    let clock = MockClock::new(start());
    let durable = Arc::new(SqliteFallbackStore::connect("sqlite::memory:", 1).await.unwrap());
    let limiter = RateLimiter::new(
        RuleCatalog::builtin(),
        Arc::new(FailingStore),
        Arc::new(FailingStore),
    )
    .with_fallback(durable.clone())
    .with_fallback_blocks(durable.clone())
    .with_clock(Arc::new(clock.clone()));
    let ctx = context();

    for _ in 0..3 {
        assert!(limiter.check(&ctx, "register", None).await.allowed);
    }
    let denied = limiter.check(&ctx, "register", None).await;
    assert!(!denied.allowed);
    assert!(!denied.blocked);

    clock.advance(Duration::from_secs(60));
    let blocked = limiter.check(&ctx, "register", None).await;
    assert!(!blocked.allowed);
    assert!(blocked.blocked);
    assert_eq!(blocked.block_until, Some(start() + chrono::Duration::hours(1)));
    assert_eq!(blocked.degraded, Some(Degraded::DurableFallback));

    assert_eq!(
        limiter.block_status(&ctx, "register").await.unwrap(),
        Some(start() + chrono::Duration::hours(1))
    );
    assert_eq!(
        durable
            .blocked_until("ip:203.0.113.5:register", clock.now())
            .await
            .unwrap(),
        Some(start() + chrono::Duration::hours(1))
    );
}

#[tokio::test]
async fn test_sweep_purges_every_store() {
    let clock = MockClock::new(start());
    let counters = Arc::new(MemoryCounterStore::new());
    let blocks = Arc::new(MemoryBlockLedger::new());
    let durable = Arc::new(MemoryBlockLedger::new());
    let limiter = RateLimiter::new(RuleCatalog::builtin(), counters.clone(), blocks.clone())
        .with_fallback_blocks(durable.clone())
        .with_clock(Arc::new(clock.clone()));
    let ctx = context();

    for _ in 0..6 {
        limiter.check(&ctx, "auth", None).await;
    }
    durable
        .block("ip:203.0.113.5:auth", start() + chrono::Duration::minutes(5), start())
        .await
        .unwrap();
    assert_eq!(counters.counter_count(), 1);
    assert_eq!(blocks.len(), 1);

    // Counter window gone, primary block still live
    clock.advance(Duration::from_secs(20 * 60));
    assert_eq!(limiter.purge_expired().await, 2);
    assert_eq!(counters.counter_count(), 0);
    assert_eq!(blocks.len(), 1);
    assert!(durable.is_empty());

    clock.advance(Duration::from_secs(20 * 60));
    assert_eq!(limiter.purge_expired().await, 1);
    assert!(blocks.is_empty());
}

#[tokio::test]
async fn test_total_outage_fails_closed_when_configured() {
    let limiter = RateLimiter::new(
        RuleCatalog::builtin(),
        Arc::new(FailingStore),
        Arc::new(MemoryBlockLedger::new()),
    )
    .with_options(LimiterOptions {
        failure_policy: FailurePolicy::Closed,
        ..LimiterOptions::default()
    });

    let result = limiter.check(&context(), "auth", None).await;
    assert!(!result.allowed);
    assert!(!result.blocked);
    assert_eq!(result.retry_after_seconds, Some(60));
    assert_eq!(result.degraded, Some(Degraded::StorageUnavailable));
}

#[tokio::test]
async fn test_slow_store_is_treated_as_failure() {
    let limiter = RateLimiter::new(
        RuleCatalog::builtin(),
        Arc::new(SlowStore),
        Arc::new(MemoryBlockLedger::new()),
    )
    .with_fallback(Arc::new(MemoryCounterStore::new()))
    .with_options(LimiterOptions {
        store_timeout: Duration::from_millis(20),
        ..LimiterOptions::default()
    });

    let result = limiter.check(&context(), "auth", None).await;
    assert!(result.allowed);
    assert_eq!(result.remaining, 4);
    assert_eq!(result.degraded, Some(Degraded::DurableFallback));
}

#[tokio::test]
async fn test_unavailable_block_ledger_still_counts() {
    let limiter = RateLimiter::new(
        RuleCatalog::builtin(),
        Arc::new(MemoryCounterStore::new()),
        Arc::new(FailingStore),
    );
    let ctx = context();

    for _ in 0..5 {
        assert!(limiter.check(&ctx, "auth", None).await.allowed);
    }
    let denied = limiter.check(&ctx, "auth", None).await;
    assert!(!denied.allowed);
    assert!(!denied.blocked);
    assert!(denied.degraded.is_none());
}

#[tokio::test]
async fn test_failing_sink_does_not_change_decision() {
    let clock = MockClock::new(start());
    let limiter = RateLimiter::in_memory(RuleCatalog::builtin())
        .with_clock(Arc::new(clock.clone()))
        .with_event_sink(Arc::new(ClosedSink));
    let ctx = context();

    for _ in 0..5 {
        assert!(limiter.check(&ctx, "auth", None).await.allowed);
    }
    let denied = limiter.check(&ctx, "auth", None).await;
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after_seconds, Some(15 * 60));

    let blocked = limiter.check(&ctx, "auth", None).await;
    assert!(blocked.blocked);
}
