//! Gatekeeper - Request Admission and Abuse Mitigation
//!
//! This crate decides, per request, whether a caller may proceed. Quotas are
//! counted in a shared fast store (Redis) with a durable SQL fallback, repeat
//! offenders are placed in a time-bounded penalty block, and every rejection
//! is reported to a pluggable event sink.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod server;
