//! Violation events and the event sink port.
//!
//! Every rejection, every emergency bypass, and every total storage outage
//! produces one [`ViolationEvent`]. Emission is fire-and-forget: sinks must
//! not block, and a failing sink never changes the decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::context::{Identifier, RateLimitContext};

/// Target used for audit records written through `tracing`.
pub const AUDIT_TARGET: &str = "gatekeeper::audit";

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    /// Rejected because of an active penalty block
    Blocked,
    /// Rejected because a rule's quota was exhausted
    Exceeded,
    /// Admitted through the emergency bypass
    EmergencyBypass,
    /// Decided without any store answering
    StorageUnavailable,
}

impl ViolationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationType::Blocked => "blocked",
            ViolationType::Exceeded => "exceeded",
            ViolationType::EmergencyBypass => "emergency_bypass",
            ViolationType::StorageUnavailable => "storage_unavailable",
        }
    }
}

/// Severity tag derived from the config key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Static key → severity map.
    pub fn for_key(key: &str) -> Self {
        let base = key.split(':').next().unwrap_or(key);
        match base {
            "admin" | "security" => Severity::Critical,
            "auth" | "password_reset" | "register" => Severity::High,
            "api" | "write" | "delete" | "export" | "upload" => Severity::Medium,
            _ => Severity::Low,
        }
    }
}

/// One structured audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationEvent {
    pub id: Uuid,
    pub identifier: String,
    pub user_id: Option<String>,
    pub ip: String,
    pub user_agent: String,
    pub endpoint: String,
    pub config_key: String,
    pub action: ViolationType,
    pub severity: Severity,
    /// Whether the request was admitted
    pub success: bool,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ViolationEvent {
    pub fn new(
        context: &RateLimitContext,
        identifier: &Identifier,
        config_key: &str,
        action: ViolationType,
        success: bool,
        details: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            identifier: identifier.to_string(),
            user_id: context.authenticated_user().map(str::to_string),
            ip: context.ip().to_string(),
            user_agent: context.user_agent.clone(),
            endpoint: context.endpoint.clone(),
            config_key: config_key.to_string(),
            action,
            severity: Severity::for_key(config_key),
            success,
            details,
            timestamp,
        }
    }
}

/// Why a sink dropped an event.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("event sink is full")]
    Full,
    #[error("event sink is closed")]
    Closed,
    #[error("event sink failed: {0}")]
    Other(String),
}

/// Consumer of violation events. Must return promptly.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ViolationEvent) -> Result<(), SinkError>;
}

/// Writes events as structured `tracing` records on [`AUDIT_TARGET`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: ViolationEvent) -> Result<(), SinkError> {
        let details = event.details.to_string();
        match event.action {
            ViolationType::StorageUnavailable => error!(
                target: AUDIT_TARGET,
                event_id = %event.id,
                identifier = %event.identifier,
                endpoint = %event.endpoint,
                config_key = %event.config_key,
                action = event.action.as_str(),
                severity = ?event.severity,
                success = event.success,
                details = %details,
                "rate limiter storage unavailable"
            ),
            ViolationType::EmergencyBypass => warn!(
                target: AUDIT_TARGET,
                event_id = %event.id,
                identifier = %event.identifier,
                endpoint = %event.endpoint,
                config_key = %event.config_key,
                action = event.action.as_str(),
                severity = ?event.severity,
                success = event.success,
                details = %details,
                "emergency bypass used"
            ),
            _ => info!(
                target: AUDIT_TARGET,
                event_id = %event.id,
                identifier = %event.identifier,
                user_id = event.user_id.as_deref().unwrap_or("-"),
                ip = %event.ip,
                endpoint = %event.endpoint,
                config_key = %event.config_key,
                action = event.action.as_str(),
                severity = ?event.severity,
                success = event.success,
                details = %details,
                "rate limit violation"
            ),
        }
        Ok(())
    }
}

/// Forwards events to a bounded channel drained by a consumer task.
///
/// When the channel is full the event is dropped rather than waiting.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::Sender<ViolationEvent>,
}

impl ChannelEventSink {
    /// Create a sink and the receiver its events arrive on.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ViolationEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: ViolationEvent) -> Result<(), SinkError> {
        self.sender.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: ViolationEvent) -> Result<(), SinkError> {
        Ok(())
    }
}
