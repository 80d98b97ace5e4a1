//! Rate limiting logic and state management.

mod backend;
mod bypass;
mod clock;
mod context;
mod counter;
mod events;
mod limiter;
mod redis_store;
mod result;
mod rules;
mod sqlite_store;

pub use backend::{BlockLedger, CounterStore, FallbackStore, WindowCount};
pub use bypass::{Bypass, BypassPolicy, EmergencyToken, Whitelist};
pub use clock::{Clock, MockClock, SystemClock};
pub use context::{Identifier, RateLimitContext, UNKNOWN_IP};
pub use counter::{MemoryBlockLedger, MemoryCounterStore};
pub use events::{
    ChannelEventSink, EventSink, NoopEventSink, Severity, SinkError, TracingEventSink,
    ViolationEvent, ViolationType, AUDIT_TARGET,
};
pub use limiter::{FailurePolicy, LimiterOptions, RateLimiter};
pub use redis_store::{RedisStore, RedisStoreConfig};
pub use result::{
    Degraded, RateLimitResult, UNLIMITED, X_RATELIMIT_BLOCKED, X_RATELIMIT_BLOCK_UNTIL,
    X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use rules::{
    LimitSpec, RateLimitConfig, RateLimitRule, Role, RuleCatalog, RuleMode,
    AUTHENTICATED_API_KEY, PUBLIC_KEY,
};
pub use sqlite_store::SqliteFallbackStore;
