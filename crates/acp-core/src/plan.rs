// SPDX-License-Identifier: MIT OR Apache-2.0
//! Compiled, content-addressed executable plans.
//!
//! An [`ExecutablePlan`] is what the compiler produces from a validated
//! capsule: a DAG of [`PlanStep`]s grouped into parallel batches, a tool
//! allowlist, and the compiled security context. The `plan_hash` is the
//! SHA-256 of the canonical hashed payload and is the contract between
//! preview and execution; it contains no timestamps.

use acp_crypto::CryptoError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::capsule::SecurityContext;

/// Risk classification attached to each compiled step.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Read-only or trivially reversible.
    Low,
    /// Mutating but recoverable.
    Medium,
    /// Mutating and hard to reverse.
    High,
    /// Irreversible or monetary.
    Critical,
}

impl RiskLevel {
    /// Failure probability used by the preflight simulator.
    #[must_use]
    pub fn failure_probability(&self) -> f64 {
        match self {
            Self::Low => 0.01,
            Self::Medium => 0.05,
            Self::High => 0.12,
            Self::Critical => 0.25,
        }
    }
}

/// Estimated resource envelope for one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceEnvelope {
    /// Expected wall-clock duration in milliseconds.
    pub est_duration_ms: u64,
    /// Expected monetary cost in micro-units of the billing currency.
    pub est_cost_micros: u64,
}

impl Default for ResourceEnvelope {
    fn default() -> Self {
        Self {
            est_duration_ms: 1_000,
            est_cost_micros: 0,
        }
    }
}

/// A single compiled step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlanStep {
    /// Step name, unique within the plan.
    pub name: String,
    /// Tool invoked by this step. Always a member of the plan's allowlist.
    pub tool: String,
    /// Tool parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Upstream step names.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Per-step timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum retry attempts.
    pub max_retries: u32,
    /// Whether execution must pause for approval before this step.
    pub requires_approval: bool,
    /// Whether the underlying tool call is safe to retry.
    pub idempotent: bool,
    /// Compiled risk classification.
    pub risk: RiskLevel,
    /// Estimated resources.
    pub resources: ResourceEnvelope,
}

/// The payload the plan hash commits to.
///
/// Deliberately excludes anything nondeterministic: no ids, no timestamps,
/// no batch layout (batches are derived from the step DAG).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HashedPlanPayload {
    /// The `name@version` reference of the source capsule.
    pub capsule_ref: String,
    /// The compiled steps, in topological order.
    pub steps: Vec<PlanStep>,
    /// Sorted tool allowlist.
    pub tool_allowlist: BTreeSet<String>,
    /// Compiled security context.
    pub security: SecurityContext,
}

/// A compiled, canonicalized, content-addressed plan.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecutablePlan {
    /// SHA-256 of the canonical [`HashedPlanPayload`].
    pub plan_hash: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// The `name@version` reference of the source capsule.
    pub capsule_ref: String,
    /// Compiled steps in topological order.
    pub steps: Vec<PlanStep>,
    /// Step names grouped into parallel batches; batch `i` only depends on
    /// steps in batches `< i`.
    pub batches: Vec<Vec<String>>,
    /// Every tool any step may invoke.
    pub tool_allowlist: BTreeSet<String>,
    /// Compiled security context.
    pub security: SecurityContext,
}

impl ExecutablePlan {
    /// Recompute the plan hash from the plan's hashed payload.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] if the payload cannot be canonicalized.
    pub fn compute_hash(&self) -> Result<String, CryptoError> {
        acp_crypto::content_hash(&self.hashed_payload())
    }

    /// The deterministic payload the plan hash commits to.
    #[must_use]
    pub fn hashed_payload(&self) -> HashedPlanPayload {
        HashedPlanPayload {
            capsule_ref: self.capsule_ref.clone(),
            steps: self.steps.clone(),
            tool_allowlist: self.tool_allowlist.clone(),
            security: self.security.clone(),
        }
    }

    /// Whether the stored hash matches the recomputed hash.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] if the payload cannot be canonicalized.
    pub fn hash_valid(&self) -> Result<bool, CryptoError> {
        Ok(self.compute_hash()? == self.plan_hash)
    }

    /// Total estimated duration along the critical path, in milliseconds.
    ///
    /// Batches run in parallel internally, so the critical path is the sum
    /// over batches of the slowest step in each batch.
    #[must_use]
    pub fn estimated_duration_ms(&self) -> u64 {
        let by_name: BTreeMap<&str, &PlanStep> =
            self.steps.iter().map(|s| (s.name.as_str(), s)).collect();
        self.batches
            .iter()
            .map(|batch| {
                batch
                    .iter()
                    .filter_map(|name| by_name.get(name.as_str()))
                    .map(|s| s.resources.est_duration_ms)
                    .max()
                    .unwrap_or(0)
            })
            .sum()
    }

    /// Whether any step declares an approval gate.
    #[must_use]
    pub fn requires_approval(&self) -> bool {
        self.steps.iter().any(|s| s.requires_approval)
    }

    /// Look up a step by name.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, depends_on: &[&str], duration_ms: u64) -> PlanStep {
        PlanStep {
            name: name.into(),
            tool: "demo_tool".into(),
            parameters: BTreeMap::new(),
            depends_on: depends_on.iter().map(|s| (*s).to_string()).collect(),
            timeout_ms: 30_000,
            max_retries: 1,
            requires_approval: false,
            idempotent: true,
            risk: RiskLevel::Low,
            resources: ResourceEnvelope {
                est_duration_ms: duration_ms,
                est_cost_micros: 0,
            },
        }
    }

    fn plan() -> ExecutablePlan {
        let mut plan = ExecutablePlan {
            plan_hash: String::new(),
            tenant_id: "T1".into(),
            capsule_ref: "invoice-sync@1.2.0".into(),
            steps: vec![
                step("a", &[], 100),
                step("b", &[], 250),
                step("c", &["a", "b"], 50),
            ],
            batches: vec![vec!["a".into(), "b".into()], vec!["c".into()]],
            tool_allowlist: ["demo_tool".to_string()].into_iter().collect(),
            security: SecurityContext::default(),
        };
        plan.plan_hash = plan.compute_hash().unwrap();
        plan
    }

    #[test]
    fn hash_roundtrip() {
        let p = plan();
        assert!(p.hash_valid().unwrap());
        assert_eq!(p.plan_hash.len(), 64);
    }

    #[test]
    fn hash_is_deterministic_across_instances() {
        assert_eq!(plan().plan_hash, plan().plan_hash);
    }

    #[test]
    fn hash_excludes_batches_and_tenant() {
        // Batches are derived data; reshuffling them must not change the hash.
        let mut p = plan();
        let original = p.plan_hash.clone();
        p.batches = vec![
            vec!["b".into()],
            vec!["a".into()],
            vec!["c".into()],
        ];
        p.tenant_id = "T2".into();
        assert_eq!(p.compute_hash().unwrap(), original);
    }

    #[test]
    fn hash_changes_with_step_content() {
        let mut p = plan();
        let original = p.plan_hash.clone();
        p.steps[0].tool = "other_tool".into();
        assert_ne!(p.compute_hash().unwrap(), original);
    }

    #[test]
    fn critical_path_sums_slowest_per_batch() {
        // Batch 1: max(100, 250) = 250; batch 2: 50.
        assert_eq!(plan().estimated_duration_ms(), 300);
    }

    #[test]
    fn approval_flag_reflects_steps() {
        let mut p = plan();
        assert!(!p.requires_approval());
        p.steps[2].requires_approval = true;
        assert!(p.requires_approval());
    }

    #[test]
    fn risk_ordering() {
        assert!(RiskLevel::Critical > RiskLevel::High);
        assert!(RiskLevel::High > RiskLevel::Medium);
        assert!(RiskLevel::Medium > RiskLevel::Low);
    }

    #[test]
    fn risk_failure_probabilities_increase() {
        let levels = [
            RiskLevel::Low,
            RiskLevel::Medium,
            RiskLevel::High,
            RiskLevel::Critical,
        ];
        for pair in levels.windows(2) {
            assert!(pair[0].failure_probability() < pair[1].failure_probability());
        }
    }
}
