// SPDX-License-Identifier: MIT OR Apache-2.0
//! CloudEvents 1.0 envelope.
//!
//! Every observable side effect of the control plane is published as a
//! CloudEvent on a hierarchical subject (`events.<domain>.<event>`). The
//! envelope carries the tenant as the `tenantid` extension attribute, and the
//! `data` payload always includes the correlation id.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The CloudEvents spec version this envelope implements.
pub const SPECVERSION: &str = "1.0";

/// Reverse-DNS prefix for all event types emitted by this control plane.
pub const TYPE_PREFIX: &str = "com.autoplane";

/// Reserved subject constants.
pub mod subjects {
    /// Plan compilation completed.
    pub const PLAN_COMPILED: &str = "events.plan.compiled";
    /// Preflight simulation completed.
    pub const PREFLIGHT_COMPLETED: &str = "events.preflight.completed";
    /// An approval was granted.
    pub const APPROVAL_GRANTED: &str = "events.approval.granted";
    /// An approval was rejected.
    pub const APPROVAL_REJECTED: &str = "events.approval.rejected";
    /// Execution started.
    pub const EXECUTION_STARTED: &str = "events.execution.started";
    /// Execution completed successfully.
    pub const EXECUTION_COMPLETED: &str = "events.execution.completed";
    /// Execution failed.
    pub const EXECUTION_FAILED: &str = "events.execution.failed";
    /// Execution was cancelled.
    pub const EXECUTION_CANCELLED: &str = "events.execution.cancelled";
    /// Audit trail entries.
    pub const AUDIT: &str = "events.audit.recorded";
}

/// A CloudEvents 1.0 envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CloudEvent {
    /// Spec version; always `"1.0"`.
    pub specversion: String,
    /// Unique event id.
    pub id: Uuid,
    /// Producing service (e.g. `"acp-orchestrator"`).
    pub source: String,
    /// Reverse-DNS event type (e.g. `"com.autoplane.execution.completed"`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// When the event occurred.
    pub time: DateTime<Utc>,
    /// Owning tenant (CloudEvents extension attribute).
    pub tenantid: String,
    /// Event-specific payload.
    pub data: serde_json::Value,
}

impl CloudEvent {
    /// Build an envelope for `subject`, deriving the event type from it.
    ///
    /// `events.execution.completed` becomes
    /// `com.autoplane.execution.completed`.
    #[must_use]
    pub fn for_subject(
        subject: &str,
        source: impl Into<String>,
        tenant_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        let event_type = match subject.strip_prefix("events.") {
            Some(rest) => format!("{TYPE_PREFIX}.{rest}"),
            None => format!("{TYPE_PREFIX}.{subject}"),
        };
        Self {
            specversion: SPECVERSION.into(),
            id: Uuid::new_v4(),
            source: source.into(),
            event_type,
            time: Utc::now(),
            tenantid: tenant_id.into(),
            data,
        }
    }

    /// The `run_id` carried in the data payload, when present.
    #[must_use]
    pub fn run_id(&self) -> Option<Uuid> {
        self.data
            .get("run_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}
