// SPDX-License-Identifier: MIT OR Apache-2.0
//! acp-core
//!
//! The stable contract for the automation control plane.
//!
//! If you only take one dependency, take this one: capsules, compiled plans,
//! run lifecycle, the CloudEvents envelope, and the tenant-scoped request
//! context all live here.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Capsule artifacts: the declarative automation unit tenants submit.
pub mod capsule;
/// CloudEvents 1.0 envelope and reserved subjects.
pub mod event;
/// Compiled, content-addressed executable plans.
pub mod plan;
/// Deterministic redaction of secrets in log and event payloads.
pub mod redact;
/// Execution run lifecycle and state machine.
pub mod run;

pub use capsule::{Capsule, CapsuleDefinition, SecurityContext, StepDefinition};
pub use event::{CloudEvent, subjects};
pub use plan::{ExecutablePlan, PlanStep, ResourceEnvelope, RiskLevel};
pub use redact::redact_value;
pub use run::{ExecutionRun, RunStatus};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current contract version string embedded in wire messages and receipts.
///
/// # Examples
///
/// ```
/// assert_eq!(acp_core::CONTRACT_VERSION, "acp/v1.0");
/// ```
pub const CONTRACT_VERSION: &str = "acp/v1.0";

/// Per-request context threaded through every component.
///
/// Carries the active tenant, the correlation id stamped on all emitted
/// events and errors, and the acting principal when one is known. Components
/// never read tenant identity from anywhere else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// The active tenant. Every read and write is scoped to this value.
    pub tenant_id: String,
    /// Correlation id propagated across component boundaries.
    pub correlation_id: Uuid,
    /// Acting principal (user or service identity), when authenticated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl RequestContext {
    /// Create a context for `tenant_id` with a fresh correlation id.
    #[must_use]
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            correlation_id: Uuid::new_v4(),
            actor: None,
        }
    }

    /// Create a context with an explicit correlation id (propagated from a
    /// caller-supplied header).
    #[must_use]
    pub fn with_correlation(tenant_id: impl Into<String>, correlation_id: Uuid) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            correlation_id,
            actor: None,
        }
    }

    /// Attach an acting principal.
    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// The audience string tokens scoped to this tenant must carry.
    #[must_use]
    pub fn audience(&self) -> String {
        format!("tenant:{}", self.tenant_id)
    }
}
