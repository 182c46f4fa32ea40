// SPDX-License-Identifier: MIT OR Apache-2.0
//! `/v1` route handlers.
//!
//! Handlers translate between HTTP shapes and component calls; every failure
//! funnels through [`Problem`]. Tenancy is enforced here for resources whose
//! services do not take a context (plans, simulations, approvals).

use acp_approvals::{Clarification, Decision, QuorumRule, StepPolicy};
use acp_core::RequestContext;
use acp_core::run::{ExecutionRun, RunStatus, StepResult};
use acp_error::ErrorCode;
use acp_orchestrator::ExecuteRequest;
use acp_preflight::{SimStatus, SimulationConfig};
use acp_receipt::ReceiptPayload;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::AppState;
use crate::middleware::IDEMPOTENCY_HEADER;
use crate::problem::Problem;

type ApiResult<T> = Result<T, Problem>;

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// `GET /health`.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "contract_version": acp_core::CONTRACT_VERSION,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "time": Utc::now().to_rfc3339(),
    }))
}

// ---------------------------------------------------------------------------
// Capability tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct IssueTokenRequest {
    pub subject: String,
    pub capabilities: Vec<String>,
    pub ttl_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct IssueTokenResponse {
    pub token: String,
    pub jti: String,
    pub exp: DateTime<Utc>,
}

/// `POST /v1/captokens`.
pub async fn issue_token(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<IssueTokenRequest>,
) -> ApiResult<Json<IssueTokenResponse>> {
    let issued = state
        .tokens
        .issue(&body.subject, &body.capabilities, body.ttl_secs, &ctx.tenant_id)
        .map_err(|e| Problem::from_code(e.code(), e.to_string(), Some(ctx.correlation_id)))?;
    Ok(Json(IssueTokenResponse {
        token: issued.token,
        jti: issued.jti,
        exp: issued.exp,
    }))
}

#[derive(Debug, Deserialize)]
pub struct VerifyTokenRequest {
    pub token: String,
}

/// `POST /v1/captokens/verify`.
///
/// Route-level statuses refine the kind defaults: replay is 409, expiry 410.
pub async fn verify_token(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<VerifyTokenRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    match state.tokens.verify(&body.token, &ctx.tenant_id) {
        Ok(claims) => Ok(Json(json!({ "valid": true, "claims": claims }))),
        Err(err) => {
            let problem = Problem::from_code(err.code(), err.to_string(), Some(ctx.correlation_id));
            Err(match err.code() {
                ErrorCode::ReplayDetected => problem.with_status(409),
                ErrorCode::TokenExpired => problem.with_status(410),
                _ => problem,
            })
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RefreshTokenRequest {
    pub token: String,
    pub new_ttl: u64,
}

/// `POST /v1/captokens/refresh`.
pub async fn refresh_token(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<RefreshTokenRequest>,
) -> ApiResult<Json<IssueTokenResponse>> {
    let issued = state
        .tokens
        .refresh(&body.token, body.new_ttl, &ctx.tenant_id)
        .map_err(|e| Problem::from_code(e.code(), e.to_string(), Some(ctx.correlation_id)))?;
    Ok(Json(IssueTokenResponse {
        token: issued.token,
        jti: issued.jti,
        exp: issued.exp,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RevokeTokenRequest {
    pub token_id: String,
}

/// `POST /v1/captokens/revoke`. Idempotent.
pub async fn revoke_token(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<RevokeTokenRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .tokens
        .revoke(&body.token_id, &ctx.tenant_id)
        .map_err(|e| Problem::from_code(e.code(), e.to_string(), Some(ctx.correlation_id)))?;
    Ok(Json(json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// Capsules
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RegisterCapsuleRequest {
    /// Capsule definition as YAML source.
    pub capsule: String,
}

/// `POST /v1/capsules`.
pub async fn register_capsule(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<RegisterCapsuleRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let definition = acp_compiler::validate::parse_yaml(&body.capsule)
        .map_err(|e| Problem::from_code(e.code(), e.to_string(), Some(ctx.correlation_id)))?;
    acp_compiler::validate::validate(&definition)
        .map_err(|e| Problem::from_code(e.code(), e.to_string(), Some(ctx.correlation_id)))?;

    let capsule = acp_core::Capsule::from_definition(&ctx.tenant_id, definition).map_err(|e| {
        Problem::from_code(ErrorCode::Internal, e.to_string(), Some(ctx.correlation_id))
    })?;
    let view = json!({
        "id": capsule.id,
        "name": capsule.name,
        "version": capsule.version,
        "checksum": capsule.checksum,
    });
    if !state.registry.insert(capsule) {
        return Err(Problem::from_code(
            ErrorCode::CapsuleExists,
            "capsule already registered at this name and version",
            Some(ctx.correlation_id),
        ));
    }
    Ok(Json(view))
}

/// `GET /v1/capsules/{id}`.
pub async fn get_capsule(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(capsule_id): Path<Uuid>,
) -> ApiResult<Json<acp_core::Capsule>> {
    state
        .registry
        .get_by_id(&ctx.tenant_id, capsule_id)
        .map(Json)
        .ok_or_else(|| {
            Problem::from_code(
                ErrorCode::CapsuleNotFound,
                format!("no capsule {capsule_id}"),
                Some(ctx.correlation_id),
            )
        })
}

// ---------------------------------------------------------------------------
// Compile & plans
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CompileRequest {
    /// Capsule definition as YAML source.
    pub capsule: String,
}

/// `POST /v1/compile`.
pub async fn compile(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<CompileRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome = state
        .compiler
        .compile_yaml(&ctx.tenant_id, &body.capsule)
        .map_err(|e| Problem::from_code(e.code(), e.to_string(), Some(ctx.correlation_id)))?;

    let event = state.compiler.compiled_event(&outcome, ctx.correlation_id);
    let _ = state.bus.publish(acp_core::subjects::PLAN_COMPILED, event);

    Ok(Json(json!({
        "plan_hash": outcome.plan_hash,
        "compiled_plan": *outcome.plan,
        "resolved_dependencies": outcome.resolved_dependencies,
        "cache_hit": outcome.cache_hit,
    })))
}

/// `GET /v1/plans/{plan_hash}`.
pub async fn get_plan(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(plan_hash): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let plan = state
        .compiler
        .get(&plan_hash)
        .filter(|p| p.tenant_id == ctx.tenant_id)
        .ok_or_else(|| {
            Problem::from_code(
                ErrorCode::PlanNotFound,
                format!("no plan {plan_hash}"),
                Some(ctx.correlation_id),
            )
        })?;
    Ok(Json(json!({ "compiled_plan": *plan })))
}

// ---------------------------------------------------------------------------
// Ghost runs (preflight)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct GhostRunRequest {
    pub plan_hash: String,
    #[serde(default)]
    pub config: Option<SimulationConfig>,
}

/// `POST /v1/ghostrun`.
pub async fn start_ghostrun(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<GhostRunRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let plan = state
        .compiler
        .get(&body.plan_hash)
        .filter(|p| p.tenant_id == ctx.tenant_id)
        .ok_or_else(|| {
            Problem::from_code(
                ErrorCode::PlanNotFound,
                format!("no plan {}", body.plan_hash),
                Some(ctx.correlation_id),
            )
        })?;
    let run_id = state.simulator.start(plan, body.config.unwrap_or_default());
    Ok(Json(json!({ "run_id": run_id, "status": SimStatus::Running })))
}

fn ghostrun_for_tenant(
    state: &AppState,
    ctx: &RequestContext,
    run_id: Uuid,
) -> Result<(), Problem> {
    match state.simulator.tenant_of(run_id) {
        Some(tenant) if tenant == ctx.tenant_id => Ok(()),
        _ => Err(Problem::from_code(
            ErrorCode::RunNotFound,
            format!("no simulation {run_id}"),
            Some(ctx.correlation_id),
        )),
    }
}

/// `GET /v1/ghostrun/{run_id}`.
pub async fn ghostrun_status(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    ghostrun_for_tenant(&state, &ctx, run_id)?;
    let (status, progress) = state.simulator.status(run_id).ok_or_else(|| {
        Problem::from_code(ErrorCode::RunNotFound, "simulation vanished", Some(ctx.correlation_id))
    })?;
    Ok(Json(json!({
        "run_id": run_id,
        "status": status,
        "progress": { "completed": progress.0, "total": progress.1 },
    })))
}

/// `GET /v1/ghostrun/{run_id}/report`.
pub async fn ghostrun_report(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    ghostrun_for_tenant(&state, &ctx, run_id)?;
    match state.simulator.report(run_id) {
        Some(report) => {
            // The completion event is published once, on first retrieval.
            let first = state
                .reported_ghostruns
                .lock()
                .map(|mut seen| seen.insert(run_id))
                .unwrap_or(false);
            if first {
                let event = state.simulator.completed_event(&report, ctx.correlation_id);
                let _ = state
                    .bus
                    .publish(acp_core::subjects::PREFLIGHT_COMPLETED, event);
            }
            Ok(Json(json!({ "report": *report })))
        }
        None => Err(Problem::from_code(
            ErrorCode::InvalidStateTransition,
            "simulation has not completed",
            Some(ctx.correlation_id),
        )),
    }
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

/// `POST /v1/execute`. Returns 202 on acceptance.
pub async fn execute(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    Json(mut body): Json<ExecuteRequest>,
) -> ApiResult<impl IntoResponse> {
    // The header wins over any key embedded in the body.
    if let Some(key) = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        body.idempotency_key = Some(key.to_string());
    }

    let response = state
        .orchestrator
        .execute(&ctx, body)
        .map_err(|e| Problem::from_code(e.code(), e.to_string(), Some(ctx.correlation_id)))?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

#[derive(Debug, Serialize)]
pub struct RunView {
    pub run_id: Uuid,
    pub plan_hash: String,
    pub status: RunStatus,
    pub progress: (u32, u32),
    pub results: Vec<StepResult>,
    pub approval_ids: Vec<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<ExecutionRun> for RunView {
    fn from(run: ExecutionRun) -> Self {
        Self {
            run_id: run.run_id,
            plan_hash: run.plan_hash,
            status: run.status,
            progress: run.progress,
            results: run.results,
            approval_ids: run.approval_ids,
            receipt_id: run.receipt_id,
            error: run.error,
        }
    }
}

/// `GET /v1/executions/{run_id}`.
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<RunView>> {
    let run = state
        .orchestrator
        .get(&ctx, run_id)
        .map_err(|e| Problem::from_code(e.code(), e.to_string(), Some(ctx.correlation_id)))?;
    Ok(Json(run.into()))
}

/// `POST /v1/executions/{run_id}/{action}` where action ∈ pause|resume|cancel.
pub async fn control_execution(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path((run_id, action)): Path<(Uuid, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let result = match action.as_str() {
        "pause" => state.orchestrator.pause(&ctx, run_id).map(|()| RunStatus::Paused),
        "resume" => state.orchestrator.resume(&ctx, run_id).map(|()| RunStatus::Running),
        "cancel" => state.orchestrator.cancel(&ctx, run_id),
        other => {
            return Err(Problem::from_code(
                ErrorCode::InvalidRequest,
                format!("unknown action '{other}'"),
                Some(ctx.correlation_id),
            ));
        }
    };
    result
        .map(|_| Json(json!({ "ok": true })))
        .map_err(|e| Problem::from_code(e.code(), e.to_string(), Some(ctx.correlation_id)))
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateApprovalRequest {
    pub run_id: Uuid,
    pub clarification: String,
    pub approvers: Vec<String>,
    #[serde(default)]
    pub deadline_secs: Option<u64>,
    #[serde(default)]
    pub quorum: Option<QuorumRule>,
}

/// `POST /v1/approvals`.
pub async fn create_approval(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<CreateApprovalRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let clarification_id = Uuid::new_v4();
    let deadline_secs = body.deadline_secs.unwrap_or(state.default_approval_deadline_secs);
    let clarification = Clarification {
        clarification_id,
        question: body.clarification,
        steps: vec![StepPolicy {
            approvers: body.approvers,
            quorum: body.quorum.unwrap_or(QuorumRule::Any),
            deadline: Utc::now() + Duration::seconds(deadline_secs as i64),
            escalation: None,
        }],
    };
    let approval_id = state
        .approvals
        .create(body.run_id, &ctx.tenant_id, clarification)
        .map_err(|e| Problem::from_code(e.code(), e.to_string(), Some(ctx.correlation_id)))?;
    Ok(Json(json!({
        "approval_id": approval_id,
        "clarification_id": clarification_id,
    })))
}

fn approval_for_tenant(
    state: &AppState,
    ctx: &RequestContext,
    approval_id: Uuid,
) -> Result<acp_approvals::ApprovalWorkflow, Problem> {
    state
        .approvals
        .get(approval_id)
        .ok()
        .filter(|wf| wf.tenant_id == ctx.tenant_id)
        .ok_or_else(|| {
            Problem::from_code(
                ErrorCode::ApprovalNotFound,
                format!("no approval {approval_id}"),
                Some(ctx.correlation_id),
            )
        })
}

/// `GET /v1/approvals/{id}`.
pub async fn get_approval(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(approval_id): Path<Uuid>,
) -> ApiResult<Json<acp_approvals::ApprovalWorkflow>> {
    Ok(Json(approval_for_tenant(&state, &ctx, approval_id)?))
}

#[derive(Debug, Deserialize)]
pub struct DecideRequest {
    pub actor: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DelegateRequest {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// `POST /v1/approvals/{id}/{action}` where action ∈ approve|reject.
pub async fn decide_approval(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path((approval_id, action)): Path<(Uuid, String)>,
    Json(body): Json<DecideRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    approval_for_tenant(&state, &ctx, approval_id)?;
    let decision = match action.as_str() {
        "approve" => Decision::Approve,
        "reject" => Decision::Reject,
        other => {
            return Err(Problem::from_code(
                ErrorCode::InvalidRequest,
                format!("unknown action '{other}'"),
                Some(ctx.correlation_id),
            ));
        }
    };
    let status = state
        .approvals
        .decide(approval_id, &body.actor, decision, body.reason)
        .map_err(|e| Problem::from_code(e.code(), e.to_string(), Some(ctx.correlation_id)))?;
    Ok(Json(json!({ "ok": true, "status": status })))
}

/// `POST /v1/approvals/{id}/delegate`.
pub async fn delegate_approval(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(approval_id): Path<Uuid>,
    Json(body): Json<DelegateRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    approval_for_tenant(&state, &ctx, approval_id)?;
    state
        .approvals
        .delegate(approval_id, &body.from, &body.to, body.reason)
        .map_err(|e| Problem::from_code(e.code(), e.to_string(), Some(ctx.correlation_id)))?;
    Ok(Json(json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateReceiptRequest {
    pub run_id: Uuid,
    pub plan_hash: String,
    pub status: RunStatus,
    pub results_digest: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub capability_token_jti: Option<String>,
}

/// `POST /v1/receipts`.
pub async fn create_receipt(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<CreateReceiptRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let receipt = state
        .receipts
        .issue(ReceiptPayload {
            run_id: body.run_id,
            plan_hash: body.plan_hash,
            tenant_id: ctx.tenant_id.clone(),
            status: body.status,
            results_digest: body.results_digest,
            started_at: body.started_at,
            completed_at: body.completed_at,
            capability_token_jti: body.capability_token_jti,
        })
        .map_err(|e| Problem::from_code(e.code(), e.to_string(), Some(ctx.correlation_id)))?;
    Ok(Json(json!({
        "receipt_id": receipt.receipt_id,
        "content_hash": receipt.content_hash,
        "signature": receipt.signature,
        "prior_receipt_hash": receipt.prior_receipt_hash,
    })))
}

/// `POST /v1/receipts/{id}/verify`.
pub async fn verify_receipt(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(receipt_id): Path<Uuid>,
) -> ApiResult<Json<acp_receipt::Verification>> {
    let verification = state
        .receipts
        .verify_by_id(&ctx.tenant_id, receipt_id)
        .map_err(|e| Problem::from_code(e.code(), e.to_string(), Some(ctx.correlation_id)))?;
    Ok(Json(verification))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

/// `GET /v1/receipts/audit`.
pub async fn receipt_audit(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let receipts = state.receipts.list_tenant(&ctx.tenant_id);
    let total = receipts.len();
    let offset = query.offset.unwrap_or(0).min(total);
    let limit = query.limit.unwrap_or(100);
    let page: Vec<_> = receipts.into_iter().skip(offset).take(limit).collect();
    let chain = state.receipts.verify_tenant_chain(&ctx.tenant_id);
    Ok(Json(json!({
        "total": total,
        "offset": offset,
        "entries": page,
        "chain_valid": chain.is_valid,
    })))
}
