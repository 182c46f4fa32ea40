// SPDX-License-Identifier: MIT OR Apache-2.0
//! Approval workflows bridging execution-time clarifications to humans.
//!
//! A workflow is an ordered sequence of approval steps. Each step carries an
//! approver set, a quorum rule, a deadline, and an optional escalation
//! target. Steps resolve by decision, delegation keeps the set current, and
//! a sweeper expires steps whose deadline passed. Every transition appends an
//! immutable audit entry. Watchers observe decisions through a
//! [`tokio::sync::watch`] channel, so propagation to the orchestrator is
//! bounded by scheduling latency, not polling.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use acp_error::ErrorCode;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from approval operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApprovalError {
    /// No workflow exists with the given id.
    #[error("approval not found")]
    NotFound,

    /// The acting principal is not in the current approver set.
    #[error("'{0}' is not an approver for the current step")]
    NotAnApprover(String),

    /// The workflow already reached a terminal status.
    #[error("approval already resolved")]
    AlreadyResolved,

    /// The run already has an open workflow.
    #[error("run already has an open approval")]
    AlreadyOpenForRun,

    /// The supplied policy is unusable.
    #[error("invalid approval policy: {0}")]
    InvalidPolicy(String),
}

impl ApprovalError {
    /// The stable error code for this failure.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound => ErrorCode::ApprovalNotFound,
            Self::NotAnApprover(_) => ErrorCode::PolicyViolation,
            Self::AlreadyResolved | Self::AlreadyOpenForRun => ErrorCode::InvalidStateTransition,
            Self::InvalidPolicy(_) => ErrorCode::InvalidRequest,
        }
    }
}

// ---------------------------------------------------------------------------
// Policy types
// ---------------------------------------------------------------------------

/// How many approvers must approve for a step to pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumRule {
    /// Every listed approver must approve.
    All,
    /// A single approval resolves the step.
    Any,
}

/// Where an expired step escalates to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    /// Replacement approver set.
    pub to: Vec<String>,
    /// How far the deadline moves forward, in seconds.
    pub extend_secs: u64,
}

/// Policy for a single approval step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPolicy {
    /// Principals allowed to decide.
    pub approvers: Vec<String>,
    /// Quorum rule.
    pub quorum: QuorumRule,
    /// Absolute deadline for a decision.
    pub deadline: DateTime<Utc>,
    /// Optional escalation on expiry. Without one, expiry fails the workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationPolicy>,
}

/// The clarification a run raises when it needs a human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clarification {
    /// Caller-assigned clarification id, used for polling.
    pub clarification_id: Uuid,
    /// The question put to the approvers.
    pub question: String,
    /// Ordered step policies. Most clarifications carry exactly one.
    pub steps: Vec<StepPolicy>,
}

// ---------------------------------------------------------------------------
// Workflow state
// ---------------------------------------------------------------------------

/// A decision on a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Approve the step.
    Approve,
    /// Reject the step (and with it, the workflow).
    Reject,
}

/// Lifecycle state of one approval step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Not yet the active step.
    Pending,
    /// Awaiting decisions.
    InProgress,
    /// Quorum approved.
    Approved,
    /// An approver rejected.
    Rejected,
    /// Deadline passed with no escalation left.
    Expired,
    /// Deadline passed and the step now awaits its escalation target.
    Escalated,
}

/// Terminal and non-terminal workflow statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// At least one step is still awaiting decisions.
    InProgress,
    /// Every step approved.
    Approved,
    /// A step was rejected.
    Rejected,
    /// A step expired without escalation.
    Expired,
}

impl WorkflowStatus {
    /// Returns `true` once the workflow can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// What an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Workflow created.
    Created,
    /// An approver decided.
    Decided,
    /// An approver delegated to another principal.
    Delegated,
    /// A step escalated after its deadline.
    Escalated,
    /// A step expired terminally.
    Expired,
}

/// One immutable audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the transition happened.
    pub at: DateTime<Utc>,
    /// Acting principal (`"system"` for sweeper transitions).
    pub actor: String,
    /// The transition kind.
    pub action: AuditAction,
    /// The decision, for [`AuditAction::Decided`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    /// Free-form reason supplied by the actor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One step of a live workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalStep {
    /// Current approver set (mutated by delegation and escalation).
    pub approvers: Vec<String>,
    /// Quorum rule.
    pub quorum: QuorumRule,
    /// Current deadline. Only ever moves forward.
    pub deadline: DateTime<Utc>,
    /// Escalation target, consumed on first expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationPolicy>,
    /// Step state.
    pub state: StepState,
    /// Approvals collected so far (actor set, for `All` quorum).
    #[serde(default)]
    pub approvals: Vec<String>,
}

/// A full approval workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalWorkflow {
    /// Unique workflow id.
    pub approval_id: Uuid,
    /// The run that raised the clarification.
    pub run_id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// The clarification this workflow answers.
    pub clarification_id: Uuid,
    /// The question put to approvers.
    pub question: String,
    /// Ordered steps.
    pub steps: Vec<ApprovalStep>,
    /// Index of the active step.
    pub current: usize,
    /// Overall status.
    pub status: WorkflowStatus,
    /// Immutable transition log.
    pub audit: Vec<AuditEntry>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

struct WorkflowEntry {
    workflow: ApprovalWorkflow,
    notify: watch::Sender<WorkflowStatus>,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// The approvals service.
///
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ApprovalsBridge {
    workflows: Arc<RwLock<HashMap<Uuid, WorkflowEntry>>>,
    by_clarification: Arc<RwLock<HashMap<Uuid, Uuid>>>,
    open_by_run: Arc<RwLock<HashMap<Uuid, Uuid>>>,
}

impl ApprovalsBridge {
    /// Create an empty bridge.
    #[must_use]
    pub fn new() -> Self {
        Self {
            workflows: Arc::new(RwLock::new(HashMap::new())),
            by_clarification: Arc::new(RwLock::new(HashMap::new())),
            open_by_run: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Open a workflow for a run's clarification.
    ///
    /// # Errors
    ///
    /// - [`ApprovalError::AlreadyOpenForRun`] if the run has an open workflow
    ///   (a run holds at most one open approval at a time).
    /// - [`ApprovalError::InvalidPolicy`] for empty steps or approver sets.
    pub fn create(
        &self,
        run_id: Uuid,
        tenant_id: &str,
        clarification: Clarification,
    ) -> Result<Uuid, ApprovalError> {
        if clarification.steps.is_empty() {
            return Err(ApprovalError::InvalidPolicy("no steps".into()));
        }
        for step in &clarification.steps {
            if step.approvers.is_empty() {
                return Err(ApprovalError::InvalidPolicy("empty approver set".into()));
            }
        }

        let mut open_by_run = lock_write(&self.open_by_run)?;
        if open_by_run.contains_key(&run_id) {
            return Err(ApprovalError::AlreadyOpenForRun);
        }

        let approval_id = Uuid::new_v4();
        let mut steps: Vec<ApprovalStep> = clarification
            .steps
            .iter()
            .map(|p| ApprovalStep {
                approvers: p.approvers.clone(),
                quorum: p.quorum,
                deadline: p.deadline,
                escalation: p.escalation.clone(),
                state: StepState::Pending,
                approvals: Vec::new(),
            })
            .collect();
        steps[0].state = StepState::InProgress;

        let workflow = ApprovalWorkflow {
            approval_id,
            run_id,
            tenant_id: tenant_id.to_string(),
            clarification_id: clarification.clarification_id,
            question: clarification.question,
            steps,
            current: 0,
            status: WorkflowStatus::InProgress,
            audit: vec![AuditEntry {
                at: Utc::now(),
                actor: "system".into(),
                action: AuditAction::Created,
                decision: None,
                reason: None,
            }],
            created_at: Utc::now(),
        };

        let (notify, _) = watch::channel(WorkflowStatus::InProgress);
        lock_write(&self.workflows)?.insert(approval_id, WorkflowEntry { workflow, notify });
        lock_write(&self.by_clarification)?.insert(clarification.clarification_id, approval_id);
        open_by_run.insert(run_id, approval_id);

        info!(target: "acp.approvals", approval_id = %approval_id, run_id = %run_id, "approval opened");
        Ok(approval_id)
    }

    /// Fetch a workflow snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::NotFound`] for unknown ids.
    pub fn get(&self, approval_id: Uuid) -> Result<ApprovalWorkflow, ApprovalError> {
        let workflows = lock_read(&self.workflows)?;
        workflows
            .get(&approval_id)
            .map(|e| e.workflow.clone())
            .ok_or(ApprovalError::NotFound)
    }

    /// Current status of the workflow answering `clarification_id`.
    #[must_use]
    pub fn poll_by_clarification(&self, clarification_id: Uuid) -> Option<WorkflowStatus> {
        let approval_id = *lock_read(&self.by_clarification).ok()?.get(&clarification_id)?;
        let workflows = lock_read(&self.workflows).ok()?;
        workflows.get(&approval_id).map(|e| e.workflow.status)
    }

    /// Subscribe to status changes for a workflow.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::NotFound`] for unknown ids.
    pub fn watch(&self, approval_id: Uuid) -> Result<watch::Receiver<WorkflowStatus>, ApprovalError> {
        let workflows = lock_read(&self.workflows)?;
        workflows
            .get(&approval_id)
            .map(|e| e.notify.subscribe())
            .ok_or(ApprovalError::NotFound)
    }

    /// Record `actor`'s decision on the active step.
    ///
    /// Rejection is final for the whole workflow. Approval advances the step
    /// when quorum is met, then the workflow when the last step approves.
    ///
    /// # Errors
    ///
    /// See [`ApprovalError`].
    pub fn decide(
        &self,
        approval_id: Uuid,
        actor: &str,
        decision: Decision,
        reason: Option<String>,
    ) -> Result<WorkflowStatus, ApprovalError> {
        let mut workflows = lock_write(&self.workflows)?;
        let entry = workflows.get_mut(&approval_id).ok_or(ApprovalError::NotFound)?;
        let workflow = &mut entry.workflow;

        if workflow.status.is_terminal() {
            return Err(ApprovalError::AlreadyResolved);
        }
        let current = workflow.current;
        let step = &mut workflow.steps[current];
        if !step.approvers.iter().any(|a| a == actor) {
            return Err(ApprovalError::NotAnApprover(actor.to_string()));
        }

        workflow.audit.push(AuditEntry {
            at: Utc::now(),
            actor: actor.to_string(),
            action: AuditAction::Decided,
            decision: Some(decision),
            reason: reason.clone(),
        });

        match decision {
            Decision::Reject => {
                step.state = StepState::Rejected;
                workflow.status = WorkflowStatus::Rejected;
            }
            Decision::Approve => {
                if !step.approvals.iter().any(|a| a == actor) {
                    step.approvals.push(actor.to_string());
                }
                let quorum_met = match step.quorum {
                    QuorumRule::Any => true,
                    QuorumRule::All => step
                        .approvers
                        .iter()
                        .all(|a| step.approvals.contains(a)),
                };
                if quorum_met {
                    step.state = StepState::Approved;
                    if current + 1 < workflow.steps.len() {
                        workflow.current += 1;
                        workflow.steps[current + 1].state = StepState::InProgress;
                    } else {
                        workflow.status = WorkflowStatus::Approved;
                    }
                }
            }
        }

        let status = workflow.status;
        debug!(
            target: "acp.approvals",
            approval_id = %approval_id,
            actor,
            ?decision,
            status = ?status,
            "decision recorded"
        );
        let _ = entry.notify.send(status);
        if status.is_terminal() {
            drop(workflows);
            self.close_run_slot(approval_id);
        }
        Ok(status)
    }

    /// Transfer `from`'s seat on the active step to `to`.
    ///
    /// # Errors
    ///
    /// See [`ApprovalError`].
    pub fn delegate(
        &self,
        approval_id: Uuid,
        from: &str,
        to: &str,
        reason: Option<String>,
    ) -> Result<(), ApprovalError> {
        let mut workflows = lock_write(&self.workflows)?;
        let entry = workflows.get_mut(&approval_id).ok_or(ApprovalError::NotFound)?;
        let workflow = &mut entry.workflow;

        if workflow.status.is_terminal() {
            return Err(ApprovalError::AlreadyResolved);
        }
        let current = workflow.current;
        let step = &mut workflow.steps[current];
        let Some(seat) = step.approvers.iter_mut().find(|a| a.as_str() == from) else {
            return Err(ApprovalError::NotAnApprover(from.to_string()));
        };
        *seat = to.to_string();

        workflow.audit.push(AuditEntry {
            at: Utc::now(),
            actor: from.to_string(),
            action: AuditAction::Delegated,
            decision: None,
            reason: reason.or_else(|| Some(format!("delegated to {to}"))),
        });
        info!(target: "acp.approvals", approval_id = %approval_id, from, to, "seat delegated");
        Ok(())
    }

    /// Expire or escalate every step whose deadline is behind `now`.
    ///
    /// Returns the ids of workflows that changed.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut changed = Vec::new();
        let Ok(mut workflows) = self.workflows.write() else {
            return changed;
        };

        for (id, entry) in workflows.iter_mut() {
            let workflow = &mut entry.workflow;
            if workflow.status.is_terminal() {
                continue;
            }
            let current = workflow.current;
            let step = &mut workflow.steps[current];
            if step.deadline > now {
                continue;
            }

            match step.escalation.take() {
                Some(escalation) => {
                    step.approvers = escalation.to;
                    step.approvals.clear();
                    // Deadlines only ever move forward.
                    step.deadline = now + Duration::seconds(escalation.extend_secs as i64);
                    step.state = StepState::Escalated;
                    workflow.audit.push(AuditEntry {
                        at: now,
                        actor: "system".into(),
                        action: AuditAction::Escalated,
                        decision: None,
                        reason: None,
                    });
                    warn!(target: "acp.approvals", approval_id = %id, "step escalated");
                }
                None => {
                    step.state = StepState::Expired;
                    workflow.status = WorkflowStatus::Expired;
                    workflow.audit.push(AuditEntry {
                        at: now,
                        actor: "system".into(),
                        action: AuditAction::Expired,
                        decision: None,
                        reason: None,
                    });
                    warn!(target: "acp.approvals", approval_id = %id, "approval expired");
                }
            }
            let _ = entry.notify.send(workflow.status);
            changed.push(*id);
        }

        let closed: Vec<Uuid> = changed
            .iter()
            .filter(|id| {
                workflows
                    .get(id)
                    .is_some_and(|e| e.workflow.status.is_terminal())
            })
            .copied()
            .collect();
        drop(workflows);
        for id in closed {
            self.close_run_slot(id);
        }
        changed
    }

    /// Spawn a background task sweeping deadlines every `interval`.
    ///
    /// Aborts when the returned handle is dropped by the caller holding it.
    #[must_use]
    pub fn spawn_sweeper(&self, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                this.sweep(Utc::now());
            }
        })
    }

    fn close_run_slot(&self, approval_id: Uuid) {
        let run_id = {
            let Ok(workflows) = self.workflows.read() else {
                return;
            };
            workflows.get(&approval_id).map(|e| e.workflow.run_id)
        };
        if let (Some(run_id), Ok(mut open)) = (run_id, self.open_by_run.write()) {
            if open.get(&run_id) == Some(&approval_id) {
                open.remove(&run_id);
            }
        }
    }
}

impl Default for ApprovalsBridge {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_read<'a, T>(
    lock: &'a Arc<RwLock<T>>,
) -> Result<std::sync::RwLockReadGuard<'a, T>, ApprovalError> {
    lock.read().map_err(|_| ApprovalError::NotFound)
}

fn lock_write<'a, T>(
    lock: &'a Arc<RwLock<T>>,
) -> Result<std::sync::RwLockWriteGuard<'a, T>, ApprovalError> {
    lock.write().map_err(|_| ApprovalError::NotFound)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
