// SPDX-License-Identifier: MIT OR Apache-2.0
//! Execution run lifecycle.
//!
//! A run is the single at-most-once execution of a compiled plan. The status
//! graph is closed: transitions happen only along [`RunStatus::valid_transitions`],
//! and terminal states are immutable.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Lifecycle status of an execution run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Accepted, not yet validated.
    Pending,
    /// Plan resolution and policy checks in progress.
    Validating,
    /// Suspended on a human approval gate.
    AwaitingApproval,
    /// Steps are executing.
    Running,
    /// Suspended by an operator.
    Paused,
    /// All steps completed.
    Succeeded,
    /// A step or gate failed terminally.
    Failed,
    /// Cancelled by request.
    Cancelled,
}

impl RunStatus {
    /// Returns `true` if this status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns the set of statuses that are valid successors of `self`.
    #[must_use]
    pub fn valid_transitions(&self) -> &'static [RunStatus] {
        match self {
            Self::Pending => &[Self::Validating, Self::Cancelled],
            Self::Validating => &[
                Self::AwaitingApproval,
                Self::Running,
                Self::Failed,
                Self::Cancelled,
            ],
            Self::AwaitingApproval => &[Self::Running, Self::Failed, Self::Cancelled],
            Self::Running => &[
                Self::Paused,
                Self::AwaitingApproval,
                Self::Succeeded,
                Self::Failed,
                Self::Cancelled,
            ],
            Self::Paused => &[Self::Running, Self::Cancelled],
            Self::Succeeded | Self::Failed | Self::Cancelled => &[],
        }
    }

    /// Returns `true` if transitioning from `self` to `next` is valid.
    #[must_use]
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Result captured for one executed step.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepResult {
    /// Step name.
    pub step: String,
    /// Whether the tool call succeeded.
    pub success: bool,
    /// Tool output payload (redacted before leaving the process).
    pub output: serde_json::Value,
    /// Attempts consumed, including the successful one.
    pub attempts: u32,
    /// Wall-clock duration of the step in milliseconds.
    pub duration_ms: u64,
}

/// The persistent record of a single execution.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionRun {
    /// Unique run identifier.
    pub run_id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// Hash of the plan this run executes. The receipt repeats this value.
    pub plan_hash: String,
    /// Current lifecycle status.
    pub status: RunStatus,
    /// Completed steps out of total steps.
    pub progress: (u32, u32),
    /// Caller-supplied execution parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Correlation id stamped on all events for this run.
    pub correlation_id: Uuid,
    /// Per-step results, in completion order.
    #[serde(default)]
    pub results: Vec<StepResult>,
    /// jti of the capability token minted for this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_token_jti: Option<String>,
    /// Approval workflows opened for this run, in creation order.
    #[serde(default)]
    pub approval_ids: Vec<Uuid>,
    /// Receipt recorded at terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_id: Option<Uuid>,
    /// Terminal error, if the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the run was accepted.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRun {
    /// Create a new run in [`RunStatus::Pending`].
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        plan_hash: impl Into<String>,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            plan_hash: plan_hash.into(),
            status: RunStatus::Pending,
            progress: (0, 0),
            parameters: BTreeMap::new(),
            correlation_id,
            results: Vec::new(),
            capability_token_jti: None,
            approval_ids: Vec::new(),
            receipt_id: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: &[RunStatus] = &[
        RunStatus::Pending,
        RunStatus::Validating,
        RunStatus::AwaitingApproval,
        RunStatus::Running,
        RunStatus::Paused,
        RunStatus::Succeeded,
        RunStatus::Failed,
        RunStatus::Cancelled,
    ];

    #[test]
    fn terminal_states_have_no_successors() {
        for s in [RunStatus::Succeeded, RunStatus::Failed, RunStatus::Cancelled] {
            assert!(s.is_terminal());
            assert!(s.valid_transitions().is_empty());
        }
    }

    #[test]
    fn non_terminal_states_have_successors() {
        for s in ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(!s.valid_transitions().is_empty(), "{s} has no successors");
        }
    }

    #[test]
    fn happy_path_is_valid() {
        let path = [
            RunStatus::Pending,
            RunStatus::Validating,
            RunStatus::Running,
            RunStatus::Succeeded,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn approval_path_is_valid() {
        assert!(RunStatus::Validating.can_transition_to(RunStatus::AwaitingApproval));
        assert!(RunStatus::AwaitingApproval.can_transition_to(RunStatus::Running));
        assert!(RunStatus::AwaitingApproval.can_transition_to(RunStatus::Failed));
    }

    #[test]
    fn pause_resume_cycle() {
        assert!(RunStatus::Running.can_transition_to(RunStatus::Paused));
        assert!(RunStatus::Paused.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Paused.can_transition_to(RunStatus::Succeeded));
    }

    #[test]
    fn no_state_leaves_terminal() {
        for terminal in ALL.iter().filter(|s| s.is_terminal()) {
            for next in ALL {
                assert!(!terminal.can_transition_to(*next));
            }
        }
    }

    #[test]
    fn pending_cannot_jump_to_running() {
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Succeeded));
    }

    #[test]
    fn mid_run_approval_gate_is_reachable() {
        // Step-level gates can suspend an already-running execution.
        assert!(RunStatus::Running.can_transition_to(RunStatus::AwaitingApproval));
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::AwaitingApproval).unwrap(),
            "\"awaiting_approval\""
        );
    }

    #[test]
    fn run_serde_roundtrip() {
        let run = ExecutionRun::new("T1", "abc123", Uuid::new_v4());
        let json = serde_json::to_string(&run).unwrap();
        let back: ExecutionRun = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_id, run.run_id);
        assert_eq!(back.status, RunStatus::Pending);
        assert_eq!(back.plan_hash, "abc123");
    }
}
