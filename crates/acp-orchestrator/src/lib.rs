// SPDX-License-Identifier: MIT OR Apache-2.0
//! The execution orchestrator.
//!
//! One accepted request becomes one run, owned by a single actor task that
//! serializes every state transition for its `run_id`. Parallelism exists
//! across runs, never within one. The actor suspends at well-defined points
//! (approval decisions, tool invocations, retry backoff) and consumes
//! pause/cancel signals there. Terminal states are immutable and always
//! leave behind a signed receipt carrying the exact plan hash that ran.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Cooperative cancellation.
pub mod cancel;
/// Idempotency records.
pub mod idempotency;
/// Execution observers.
pub mod observe;
/// Retry backoff policy.
pub mod retry;

pub use cancel::{CancelReason, CancelSignal};
pub use idempotency::{BeginOutcome, IdempotencyStore};
pub use observe::{ExecutionObserver, ObserverRegistry, TracingObserver};
pub use retry::RetryPolicy;

use acp_approvals::{ApprovalsBridge, Clarification, QuorumRule, StepPolicy, WorkflowStatus};
use acp_bus::EventBus;
use acp_captoken::{TokenError, TokenService};
use acp_compiler::PlanCompiler;
use acp_config::ControlPlaneConfig;
use acp_core::plan::{ExecutablePlan, PlanStep};
use acp_core::run::{ExecutionRun, RunStatus, StepResult};
use acp_core::{CloudEvent, RequestContext, subjects};
use acp_error::ErrorCode;
use acp_receipt::{ReceiptPayload, ReceiptService};
use acp_toolproto::{ToolSession, ToolTransport};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Default approver set when a gated request names none.
const DEFAULT_APPROVERS: &[&str] = &["ops"];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The request is structurally unusable.
    #[error("invalid execute request: {0}")]
    InvalidRequest(String),

    /// No plan could be resolved for the requested hash.
    #[error("plan not found: {0}")]
    PlanNotFound(String),

    /// No run exists with the requested id for the tenant.
    #[error("run not found")]
    RunNotFound,

    /// The tenant is at its concurrent-run bound.
    #[error("tenant at concurrent run limit; retry after {retry_after_secs}s")]
    ServiceBusy {
        /// Suggested client backoff.
        retry_after_secs: u64,
    },

    /// The idempotency key was reused with a different request.
    #[error("idempotency key reused with a different request")]
    IdempotencyConflict,

    /// The run's current state forbids the requested control operation.
    #[error("operation invalid in state {from}")]
    InvalidTransition {
        /// The state the run was in.
        from: RunStatus,
    },

    /// Capability token issuance or verification failed.
    #[error("capability failure")]
    Token(#[from] TokenError),

    /// Invariant violation.
    #[error("internal orchestrator error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// The stable error code for this failure.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::PlanNotFound(_) => ErrorCode::PlanNotFound,
            Self::RunNotFound => ErrorCode::RunNotFound,
            Self::ServiceBusy { .. } => ErrorCode::ServiceBusy,
            Self::IdempotencyConflict => ErrorCode::IdempotencyConflict,
            Self::InvalidTransition { .. } => ErrorCode::InvalidStateTransition,
            Self::Token(e) => e.code(),
            Self::Internal(_) => ErrorCode::Internal,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests / responses
// ---------------------------------------------------------------------------

/// An execute request, as accepted on the API surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Hash of a previously compiled plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_hash: Option<String>,
    /// Inline plan, admitted after hash re-verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<ExecutablePlan>,
    /// Run-scoped parameters, merged under each step's own parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// Engine (registered tool transport) to execute against.
    pub engine: String,
    /// Force an approval gate even when no step declares one.
    #[serde(default)]
    pub require_approval: bool,
    /// Approvers for the gate; defaults to the operations group.
    #[serde(default)]
    pub approvers: Vec<String>,
    /// Client-supplied idempotency key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl ExecuteRequest {
    /// The canonical fingerprint of this request for idempotency matching.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Internal`] if canonicalization fails.
    pub fn fingerprint(&self, tenant_id: &str) -> Result<String, OrchestratorError> {
        let normalized = json!({
            "tenant": tenant_id,
            "plan_hash": self.plan_hash,
            "inline_plan_hash": self.plan.as_ref().map(|p| p.plan_hash.clone()),
            "parameters": self.parameters,
            "engine": self.engine,
            "require_approval": self.require_approval,
        });
        acp_crypto::content_hash(&normalized).map_err(|e| OrchestratorError::Internal(e.to_string()))
    }
}

/// Response to an execute request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    /// The run executing (or having executed) the request.
    pub run_id: Uuid,
    /// Status at response time.
    pub status: RunStatus,
    /// Receipt id once the run is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_id: Option<Uuid>,
    /// `true` when this response was served from the idempotency cache.
    #[serde(default)]
    pub replayed: bool,
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

/// Everything the orchestrator needs, injected at startup.
pub struct Dependencies {
    /// Plan compiler (and plan cache).
    pub compiler: PlanCompiler,
    /// Capability token service.
    pub tokens: Arc<TokenService>,
    /// Approvals bridge.
    pub approvals: ApprovalsBridge,
    /// Receipt service.
    pub receipts: Arc<ReceiptService>,
    /// Event bus.
    pub bus: EventBus,
    /// Engine name → tool transport.
    pub engines: HashMap<String, Arc<dyn ToolTransport>>,
    /// Observers, fired in registration order.
    pub observers: ObserverRegistry,
    /// Immutable configuration.
    pub config: ControlPlaneConfig,
}

struct RunHandle {
    run: Arc<RwLock<ExecutionRun>>,
    cancel: CancelSignal,
    pause: watch::Sender<bool>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// The execution orchestrator. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    compiler: PlanCompiler,
    tokens: Arc<TokenService>,
    approvals: ApprovalsBridge,
    receipts: Arc<ReceiptService>,
    bus: EventBus,
    engines: Arc<HashMap<String, Arc<dyn ToolTransport>>>,
    observers: Arc<ObserverRegistry>,
    idempotency: Arc<IdempotencyStore>,
    retry: RetryPolicy,
    max_runs_per_tenant: usize,
    approval_deadline_secs: u64,
    token_ttl_ceiling: u64,
    runs: Arc<RwLock<HashMap<Uuid, RunHandle>>>,
}

impl Orchestrator {
    /// Assemble an orchestrator from its dependencies.
    #[must_use]
    pub fn new(deps: Dependencies) -> Self {
        Self {
            compiler: deps.compiler,
            tokens: deps.tokens,
            approvals: deps.approvals,
            receipts: deps.receipts,
            bus: deps.bus,
            engines: Arc::new(deps.engines),
            observers: Arc::new(deps.observers),
            idempotency: Arc::new(IdempotencyStore::new(deps.config.idempotency.record_ttl_hours)),
            retry: RetryPolicy::from_config(&deps.config.retry),
            max_runs_per_tenant: deps.config.orchestrator.max_concurrent_runs_per_tenant,
            approval_deadline_secs: deps.config.approval.default_deadline_seconds,
            token_ttl_ceiling: deps.config.token.max_ttl_seconds,
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The approvals bridge (shared with the HTTP surface).
    #[must_use]
    pub fn approvals(&self) -> &ApprovalsBridge {
        &self.approvals
    }

    /// Accept an execute request; the run proceeds asynchronously.
    ///
    /// # Errors
    ///
    /// See [`OrchestratorError`].
    pub fn execute(
        &self,
        ctx: &RequestContext,
        request: ExecuteRequest,
    ) -> Result<ExecuteResponse, OrchestratorError> {
        if request.plan_hash.is_none() && request.plan.is_none() {
            return Err(OrchestratorError::InvalidRequest(
                "one of plan_hash or plan is required".into(),
            ));
        }
        if !self.engines.contains_key(&request.engine) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "unknown engine '{}'",
                request.engine
            )));
        }

        if self.active_runs_for(&ctx.tenant_id) >= self.max_runs_per_tenant {
            return Err(OrchestratorError::ServiceBusy { retry_after_secs: 5 });
        }

        let plan_hash = request
            .plan_hash
            .clone()
            .or_else(|| request.plan.as_ref().map(|p| p.plan_hash.clone()))
            .unwrap_or_default();
        let run_id = Uuid::new_v4();

        // Idempotency: reserve before any work; replay or conflict otherwise.
        if let Some(key) = &request.idempotency_key {
            let fingerprint = request.fingerprint(&ctx.tenant_id)?;
            match self.idempotency.begin(&ctx.tenant_id, key, &fingerprint, run_id) {
                BeginOutcome::Fresh => {}
                BeginOutcome::Conflict => return Err(OrchestratorError::IdempotencyConflict),
                BeginOutcome::Replay(cached) => {
                    let mut response: ExecuteResponse = serde_json::from_value(cached)
                        .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
                    response.replayed = true;
                    return Ok(response);
                }
                BeginOutcome::InFlight(existing) => {
                    let status = self
                        .snapshot(existing)
                        .map(|r| r.status)
                        .unwrap_or(RunStatus::Pending);
                    return Ok(ExecuteResponse {
                        run_id: existing,
                        status,
                        receipt_id: None,
                        replayed: true,
                    });
                }
            }
        }

        let mut run = ExecutionRun::new(&ctx.tenant_id, plan_hash, ctx.correlation_id);
        run.run_id = run_id;
        run.parameters = request.parameters.clone();
        let run = Arc::new(RwLock::new(run));

        let cancel = CancelSignal::new();
        let (pause, _) = watch::channel(false);
        {
            let mut runs = self
                .runs
                .write()
                .map_err(|_| OrchestratorError::Internal("run table poisoned".into()))?;
            runs.insert(
                run_id,
                RunHandle {
                    run: Arc::clone(&run),
                    cancel: cancel.clone(),
                    pause: pause.clone(),
                },
            );
        }

        if let Some(snapshot) = self.snapshot(run_id) {
            self.observers.run_started(&snapshot);
        }

        let this = self.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            this.run_actor(run_id, request, ctx).await;
        });

        Ok(ExecuteResponse {
            run_id,
            status: RunStatus::Pending,
            receipt_id: None,
            replayed: false,
        })
    }

    /// Snapshot of a run, tenant-scoped.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::RunNotFound`] for unknown runs and for
    /// runs owned by another tenant.
    pub fn get(&self, ctx: &RequestContext, run_id: Uuid) -> Result<ExecutionRun, OrchestratorError> {
        let snapshot = self.snapshot(run_id).ok_or(OrchestratorError::RunNotFound)?;
        if snapshot.tenant_id != ctx.tenant_id {
            return Err(OrchestratorError::RunNotFound);
        }
        Ok(snapshot)
    }

    /// Request a pause. The actor parks at its next suspension point.
    ///
    /// # Errors
    ///
    /// See [`OrchestratorError`].
    pub fn pause(&self, ctx: &RequestContext, run_id: Uuid) -> Result<(), OrchestratorError> {
        let run = self.get(ctx, run_id)?;
        if run.status.is_terminal() || !run.status.can_transition_to(RunStatus::Paused) {
            return Err(OrchestratorError::InvalidTransition { from: run.status });
        }
        let runs = self
            .runs
            .read()
            .map_err(|_| OrchestratorError::Internal("run table poisoned".into()))?;
        if let Some(handle) = runs.get(&run_id) {
            handle.pause.send_replace(true);
        }
        Ok(())
    }

    /// Lift a pause.
    ///
    /// # Errors
    ///
    /// See [`OrchestratorError`].
    pub fn resume(&self, ctx: &RequestContext, run_id: Uuid) -> Result<(), OrchestratorError> {
        let run = self.get(ctx, run_id)?;
        if run.status.is_terminal() {
            return Err(OrchestratorError::InvalidTransition { from: run.status });
        }
        let runs = self
            .runs
            .read()
            .map_err(|_| OrchestratorError::Internal("run table poisoned".into()))?;
        if let Some(handle) = runs.get(&run_id) {
            handle.pause.send_replace(false);
        }
        Ok(())
    }

    /// Request cancellation. Idempotent; consumed at the next suspension
    /// point.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::RunNotFound`] for unknown runs.
    pub fn cancel(&self, ctx: &RequestContext, run_id: Uuid) -> Result<RunStatus, OrchestratorError> {
        let run = self.get(ctx, run_id)?;
        if run.status.is_terminal() {
            // Cancelling a finished run is a no-op, not an error.
            return Ok(run.status);
        }
        let runs = self
            .runs
            .read()
            .map_err(|_| OrchestratorError::Internal("run table poisoned".into()))?;
        if let Some(handle) = runs.get(&run_id) {
            handle.cancel.cancel(CancelReason::Requested);
            // Wake a paused actor so it can observe the signal.
            handle.pause.send_replace(false);
        }
        Ok(run.status)
    }

    // -- internals ----------------------------------------------------------

    fn active_runs_for(&self, tenant_id: &str) -> usize {
        let Ok(runs) = self.runs.read() else {
            return usize::MAX;
        };
        runs.values()
            .filter(|h| {
                h.run
                    .read()
                    .map(|r| r.tenant_id == tenant_id && !r.status.is_terminal())
                    .unwrap_or(false)
            })
            .count()
    }

    fn snapshot(&self, run_id: Uuid) -> Option<ExecutionRun> {
        let runs = self.runs.read().ok()?;
        let handle = runs.get(&run_id)?;
        handle.run.read().ok().map(|r| r.clone())
    }

    fn with_run<F: FnOnce(&mut ExecutionRun)>(&self, run_id: Uuid, f: F) -> Option<ExecutionRun> {
        let runs = self.runs.read().ok()?;
        let handle = runs.get(&run_id)?;
        let mut run = handle.run.write().ok()?;
        f(&mut run);
        Some(run.clone())
    }

    fn transition(&self, run_id: Uuid, to: RunStatus) -> Result<ExecutionRun, OrchestratorError> {
        let mut from = None;
        let snapshot = self
            .with_run(run_id, |run| {
                if run.status.can_transition_to(to) {
                    from = Some(run.status);
                    run.status = to;
                    if to.is_terminal() {
                        run.completed_at = Some(Utc::now());
                    }
                }
            })
            .ok_or(OrchestratorError::RunNotFound)?;

        match from {
            Some(from) => {
                self.observers.state_changed(&snapshot, from, to);
                Ok(snapshot)
            }
            None => Err(OrchestratorError::Internal(format!(
                "invalid transition {} -> {to}",
                snapshot.status
            ))),
        }
    }

    fn publish(&self, subject: &str, tenant: &str, data: Value) {
        let event = CloudEvent::for_subject(subject, "acp-orchestrator", tenant, data);
        if let Err(err) = self.bus.publish(subject, event) {
            error!(target: "acp.orchestrator", subject, error = %err, "event publish failed");
        }
    }

    fn event_data(run: &ExecutionRun, extra: Value) -> Value {
        let mut data = json!({
            "run_id": run.run_id.to_string(),
            "plan_hash": run.plan_hash,
            "tenant_id": run.tenant_id,
            "correlation_id": run.correlation_id.to_string(),
            "occurred_at": Utc::now().to_rfc3339(),
        });
        if let (Value::Object(base), Value::Object(more)) = (&mut data, extra) {
            base.extend(more);
        }
        data
    }

    /// Drive one run to a terminal state. Owns every transition for the run.
    async fn run_actor(&self, run_id: Uuid, request: ExecuteRequest, ctx: RequestContext) {
        let (cancel, pause_rx) = {
            let Ok(runs) = self.runs.read() else { return };
            let Some(handle) = runs.get(&run_id) else { return };
            (handle.cancel.clone(), handle.pause.subscribe())
        };

        if self.transition(run_id, RunStatus::Validating).is_err() {
            return;
        }

        // Resolve the plan: inline (re-verified) or by hash from the cache.
        let plan = match self.resolve_plan(&request, &ctx) {
            Ok(plan) => plan,
            Err(err) => {
                self.finish(run_id, RunStatus::Failed, Some(err.to_string()), &request, &ctx);
                return;
            }
        };
        self.with_run(run_id, |run| {
            run.plan_hash = plan.plan_hash.clone();
            run.progress = (0, plan.steps.len() as u32);
        });

        // Approval gate, before any capability is minted.
        if request.require_approval || plan.requires_approval() {
            match self.await_approval(run_id, &request, &ctx, &cancel).await {
                Ok(true) => {}
                Ok(false) => return, // finish() already called
                Err(err) => {
                    self.finish(run_id, RunStatus::Failed, Some(err.to_string()), &request, &ctx);
                    return;
                }
            }
        }

        // Capability token scoped to the plan's allowlist, bounded TTL.
        let capabilities: Vec<String> = plan.tool_allowlist.iter().cloned().collect();
        let ttl = (plan.estimated_duration_ms() / 1_000 + 60)
            .clamp(1, self.token_ttl_ceiling);
        let issued = match self
            .tokens
            .issue(&format!("run:{run_id}"), &capabilities, ttl, &ctx.tenant_id)
        {
            Ok(issued) => issued,
            Err(err) => {
                self.finish(run_id, RunStatus::Failed, Some(err.to_string()), &request, &ctx);
                return;
            }
        };
        self.with_run(run_id, |run| {
            run.capability_token_jti = Some(issued.jti.clone());
        });

        if self.transition(run_id, RunStatus::Running).is_err() {
            return;
        }
        if let Some(run) = self.snapshot(run_id) {
            self.publish(
                subjects::EXECUTION_STARTED,
                &ctx.tenant_id,
                Self::event_data(&run, json!({})),
            );
        }

        // One negotiated session per run; every invocation carries the token.
        let transport = match self.engines.get(&request.engine) {
            Some(t) => Arc::clone(t),
            None => {
                self.finish(
                    run_id,
                    RunStatus::Failed,
                    Some(format!("engine '{}' disappeared", request.engine)),
                    &request,
                    &ctx,
                );
                return;
            }
        };
        let session = match ToolSession::connect(transport, &issued.token).await {
            Ok(session) => session,
            Err(err) => {
                self.finish(run_id, RunStatus::Failed, Some(err.to_string()), &request, &ctx);
                return;
            }
        };

        // Steps run strictly in topological order within the run.
        for step in &plan.steps {
            if self
                .wait_if_paused(run_id, &cancel, pause_rx.clone())
                .await
                .is_err()
            {
                self.finish(run_id, RunStatus::Cancelled, None, &request, &ctx);
                return;
            }
            if cancel.is_cancelled() {
                self.finish(run_id, RunStatus::Cancelled, None, &request, &ctx);
                return;
            }

            match self.invoke_step(&session, step, &request, &cancel).await {
                Ok(result) => {
                    let snapshot = self.with_run(run_id, |run| {
                        run.progress.0 += 1;
                        run.results.push(result.clone());
                    });
                    if let Some(run) = snapshot {
                        self.observers.step_completed(&run, &result);
                    }
                }
                Err(StepFailure::Cancelled) => {
                    self.finish(run_id, RunStatus::Cancelled, None, &request, &ctx);
                    return;
                }
                Err(StepFailure::Terminal { result, message }) => {
                    self.with_run(run_id, |run| {
                        run.results.push(result.clone());
                    });
                    self.finish(
                        run_id,
                        RunStatus::Failed,
                        Some(format!("step '{}' failed: {message}", step.name)),
                        &request,
                        &ctx,
                    );
                    return;
                }
            }
        }

        self.finish(run_id, RunStatus::Succeeded, None, &request, &ctx);
    }

    fn resolve_plan(
        &self,
        request: &ExecuteRequest,
        ctx: &RequestContext,
    ) -> Result<Arc<ExecutablePlan>, OrchestratorError> {
        let plan = match (&request.plan, &request.plan_hash) {
            (Some(inline), hash) => {
                if let Some(hash) = hash {
                    if *hash != inline.plan_hash {
                        return Err(OrchestratorError::InvalidRequest(
                            "plan_hash does not match the inline plan".into(),
                        ));
                    }
                }
                self.compiler
                    .admit(inline.clone())
                    .map_err(|e| OrchestratorError::InvalidRequest(e.to_string()))?
            }
            (None, Some(hash)) => self
                .compiler
                .get(hash)
                .ok_or_else(|| OrchestratorError::PlanNotFound(hash.clone()))?,
            (None, None) => {
                return Err(OrchestratorError::InvalidRequest(
                    "one of plan_hash or plan is required".into(),
                ));
            }
        };

        // Plans are tenant artifacts; another tenant's plan is invisible.
        if plan.tenant_id != ctx.tenant_id {
            return Err(OrchestratorError::PlanNotFound(plan.plan_hash.clone()));
        }
        Ok(plan)
    }

    /// Open the approval workflow and wait for its decision.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` when the run was finished
    /// here (denial or cancellation).
    async fn await_approval(
        &self,
        run_id: Uuid,
        request: &ExecuteRequest,
        ctx: &RequestContext,
        cancel: &CancelSignal,
    ) -> Result<bool, OrchestratorError> {
        self.transition(run_id, RunStatus::AwaitingApproval)?;

        let approvers: Vec<String> = if request.approvers.is_empty() {
            DEFAULT_APPROVERS.iter().map(|s| (*s).to_string()).collect()
        } else {
            request.approvers.clone()
        };
        let clarification = Clarification {
            clarification_id: Uuid::new_v4(),
            question: format!("approve execution of plan {}", request.plan_hash.as_deref().unwrap_or("?")),
            steps: vec![StepPolicy {
                approvers,
                quorum: QuorumRule::Any,
                deadline: Utc::now() + ChronoDuration::seconds(self.approval_deadline_secs as i64),
                escalation: None,
            }],
        };

        let approval_id = self
            .approvals
            .create(run_id, &ctx.tenant_id, clarification)
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        self.with_run(run_id, |run| run.approval_ids.push(approval_id));

        let mut rx = self
            .approvals
            .watch(approval_id)
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        let status = loop {
            let current = *rx.borrow();
            if current.is_terminal() {
                break current;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break *rx.borrow();
                    }
                }
                () = cancel.cancelled() => {
                    self.finish(run_id, RunStatus::Cancelled, None, request, ctx);
                    return Ok(false);
                }
            }
        };

        match status {
            WorkflowStatus::Approved => {
                if let Some(run) = self.snapshot(run_id) {
                    self.publish(
                        subjects::APPROVAL_GRANTED,
                        &ctx.tenant_id,
                        Self::event_data(&run, json!({ "approval_id": approval_id.to_string() })),
                    );
                }
                Ok(true)
            }
            WorkflowStatus::Rejected | WorkflowStatus::Expired => {
                if let Some(run) = self.snapshot(run_id) {
                    self.publish(
                        subjects::APPROVAL_REJECTED,
                        &ctx.tenant_id,
                        Self::event_data(
                            &run,
                            json!({ "approval_id": approval_id.to_string(), "outcome": status }),
                        ),
                    );
                }
                self.finish(
                    run_id,
                    RunStatus::Failed,
                    Some(match status {
                        WorkflowStatus::Expired => "approval expired".into(),
                        _ => "approval rejected".into(),
                    }),
                    request,
                    ctx,
                );
                Ok(false)
            }
            WorkflowStatus::InProgress => Err(OrchestratorError::Internal(
                "approval watch ended while in progress".into(),
            )),
        }
    }

    /// Park while the pause flag is set. Errors when cancelled while parked.
    async fn wait_if_paused(
        &self,
        run_id: Uuid,
        cancel: &CancelSignal,
        mut pause_rx: watch::Receiver<bool>,
    ) -> Result<(), ()> {
        if !*pause_rx.borrow() {
            return Ok(());
        }
        let _ = self.transition(run_id, RunStatus::Paused);

        loop {
            if cancel.is_cancelled() {
                return Err(());
            }
            if !*pause_rx.borrow() {
                let _ = self.transition(run_id, RunStatus::Running);
                return Ok(());
            }
            tokio::select! {
                changed = pause_rx.changed() => {
                    if changed.is_err() {
                        return Err(());
                    }
                }
                () = cancel.cancelled() => return Err(()),
            }
        }
    }

    /// Invoke one step with retry semantics.
    async fn invoke_step(
        &self,
        session: &ToolSession,
        step: &PlanStep,
        request: &ExecuteRequest,
        cancel: &CancelSignal,
    ) -> Result<StepResult, StepFailure> {
        // Run-level parameters fill gaps; step parameters win.
        let mut parameters = request.parameters.clone();
        for (k, v) in &step.parameters {
            parameters.insert(k.clone(), v.clone());
        }

        // A pass-through idempotency key marks even non-idempotent tools
        // safe to retry end-to-end.
        let invocation_key = request
            .idempotency_key
            .as_ref()
            .map(|key| format!("{key}:{}", step.name));
        let retry_eligible = step.idempotent || invocation_key.is_some();
        let attempt_ceiling = self.retry.max_attempts.min(step.max_retries + 1).max(1);

        let started = std::time::Instant::now();
        let mut attempts = 0_u32;
        loop {
            attempts += 1;
            let outcome = tokio::select! {
                outcome = session.invoke(&step.tool, &parameters, invocation_key.clone(), step.timeout_ms) => outcome,
                () = cancel.cancelled() => {
                    // Abandon the in-flight response; the timeout path inside
                    // the session delivers protocol-level cancellation.
                    return Err(StepFailure::Cancelled);
                }
            };

            match outcome {
                Ok(result) => {
                    return Ok(StepResult {
                        step: step.name.clone(),
                        success: true,
                        output: result.output,
                        attempts,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(err) => {
                    let may_retry =
                        retry_eligible && err.is_retryable() && attempts < attempt_ceiling;
                    if !may_retry {
                        warn!(
                            target: "acp.orchestrator",
                            step = %step.name,
                            attempts,
                            error = %err,
                            "step failed terminally"
                        );
                        return Err(StepFailure::Terminal {
                            result: StepResult {
                                step: step.name.clone(),
                                success: false,
                                output: Value::Null,
                                attempts,
                                duration_ms: started.elapsed().as_millis() as u64,
                            },
                            message: err.to_string(),
                        });
                    }

                    let delay = self.retry.delay_for(attempts);
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return Err(StepFailure::Cancelled),
                    }
                }
            }
        }
    }

    /// Drive the run to `status`, emit the receipt and events, finalize the
    /// idempotency record, and fire observers.
    fn finish(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error_message: Option<String>,
        request: &ExecuteRequest,
        ctx: &RequestContext,
    ) {
        let Ok(snapshot) = self.transition(run_id, status) else {
            return;
        };
        let snapshot = self
            .with_run(run_id, |run| {
                run.error = error_message.clone();
            })
            .unwrap_or(snapshot);

        // The receipt binds the exact plan hash that was previewed and run.
        let receipt_id = match self.issue_receipt(&snapshot) {
            Ok(id) => Some(id),
            Err(err) => {
                error!(
                    target: "acp.orchestrator",
                    run_id = %run_id,
                    error = %err,
                    "receipt emission failed"
                );
                None
            }
        };
        let snapshot = self
            .with_run(run_id, |run| run.receipt_id = receipt_id)
            .unwrap_or(snapshot);

        let subject = match status {
            RunStatus::Succeeded => subjects::EXECUTION_COMPLETED,
            RunStatus::Cancelled => subjects::EXECUTION_CANCELLED,
            _ => subjects::EXECUTION_FAILED,
        };
        let mut extra = json!({
            "status": status,
            "receipt_id": receipt_id.map(|id| id.to_string()),
        });
        if let Some(message) = &snapshot.error {
            extra["error"] = json!(message);
        }
        self.publish(subject, &ctx.tenant_id, Self::event_data(&snapshot, extra));

        if let Some(key) = &request.idempotency_key {
            self.idempotency.finalize(
                &ctx.tenant_id,
                key,
                json!({
                    "run_id": snapshot.run_id,
                    "status": status,
                    "receipt_id": receipt_id,
                }),
            );
        }

        info!(
            target: "acp.orchestrator",
            run_id = %run_id,
            status = %status,
            "run finished"
        );
        self.observers.run_finished(&snapshot);
    }

    fn issue_receipt(&self, run: &ExecutionRun) -> Result<Uuid, OrchestratorError> {
        let results_digest = acp_crypto::content_hash(&run.results)
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        let receipt = self
            .receipts
            .issue(ReceiptPayload {
                run_id: run.run_id,
                plan_hash: run.plan_hash.clone(),
                tenant_id: run.tenant_id.clone(),
                status: run.status,
                results_digest,
                started_at: run.started_at,
                completed_at: run.completed_at.unwrap_or_else(Utc::now),
                capability_token_jti: run.capability_token_jti.clone(),
            })
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        Ok(receipt.receipt_id)
    }
}

enum StepFailure {
    Cancelled,
    Terminal { result: StepResult, message: String },
}
