// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP surface and process wiring for the control plane.
//!
//! The gateway owns nothing domain-specific: it builds each component with
//! explicit dependency injection, mounts the `/v1` routes, and installs the
//! request pipeline (correlation id → tenant context → logging). Durable
//! backends (replay guard, receipt store, WORM sink) are the default here;
//! in-memory variants exist only inside component tests.

#![deny(unsafe_code)]

/// `/v1` route handlers.
pub mod api;
/// Request pipeline middleware.
pub mod middleware;
/// RFC 7807 problem responses.
pub mod problem;

use acp_approvals::ApprovalsBridge;
use acp_bus::{BusConfig, EventBus};
use acp_captoken::{FileReplayGuard, TokenService};
use acp_compiler::{MemoryRegistry, PlanCompiler};
use acp_config::ControlPlaneConfig;
use acp_crypto::Keypair;
use acp_orchestrator::{Dependencies, ObserverRegistry, Orchestrator, TracingObserver};
use acp_preflight::{MockToolRegistry, PreflightSimulator};
use acp_receipt::{ReceiptService, ReceiptStore, WormSink};
use acp_toolproto::ToolTransport;
use anyhow::{Context, Result, bail};
use axum::routing::{get, post};
use axum::{Router, middleware as axum_middleware};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Shared state handed to every handler.
pub struct AppState {
    /// Execution orchestrator.
    pub orchestrator: Orchestrator,
    /// Plan compiler and cache.
    pub compiler: PlanCompiler,
    /// Preflight simulator.
    pub simulator: PreflightSimulator,
    /// Capability token service.
    pub tokens: Arc<TokenService>,
    /// Receipt service.
    pub receipts: Arc<ReceiptService>,
    /// Approvals bridge.
    pub approvals: ApprovalsBridge,
    /// Capsule registry (the in-process seam implementation).
    pub registry: Arc<MemoryRegistry>,
    /// Event bus.
    pub bus: EventBus,
    /// Deadline applied when an approval request does not set one.
    pub default_approval_deadline_secs: u64,
    /// Ghost runs whose completion event has been published.
    pub reported_ghostruns: std::sync::Mutex<std::collections::HashSet<uuid::Uuid>>,
    /// Process start, for the health endpoint.
    pub started_at: Instant,
}

/// Resolve the signing key from its opaque configuration reference.
///
/// Supported forms: `ephemeral` (fresh key each start), `env:<VAR>` (base64
/// seed in an environment variable), `file:<path>` (base64 seed on disk).
///
/// # Errors
///
/// Fails when the reference is unknown or the material is unreadable.
pub fn resolve_signing_key(reference: &str) -> Result<Keypair> {
    if reference == "ephemeral" {
        return Ok(Keypair::generate());
    }
    if let Some(var) = reference.strip_prefix("env:") {
        let seed = std::env::var(var).with_context(|| format!("read signing key from ${var}"))?;
        return Keypair::from_seed_b64(seed.trim())
            .with_context(|| format!("decode signing key from ${var}"));
    }
    if let Some(path) = reference.strip_prefix("file:") {
        let seed = std::fs::read_to_string(path)
            .with_context(|| format!("read signing key file {path}"))?;
        return Keypair::from_seed_b64(seed.trim())
            .with_context(|| format!("decode signing key file {path}"));
    }
    bail!("unsupported signing key reference '{reference}'")
}

/// Assemble every component from configuration and the engine map.
///
/// # Errors
///
/// Fails when durable state under `server.data_dir` cannot be opened or the
/// signing key cannot be resolved.
pub fn build_state(
    config: &ControlPlaneConfig,
    engines: HashMap<String, Arc<dyn ToolTransport>>,
) -> Result<Arc<AppState>> {
    let data_dir = Path::new(&config.server.data_dir);

    let signing = resolve_signing_key(&config.crypto.signing_key_ref)?;
    let seed = signing.seed_b64();

    // Durable replay guard: the in-memory backend is test-only.
    let guard = FileReplayGuard::open(data_dir.join("replay-guard.jsonl"))
        .context("open replay guard")?;
    let tokens = Arc::new(TokenService::new(signing, Arc::new(guard)));

    let store = ReceiptStore::open(data_dir.join("receipts")).context("open receipt store")?;
    let receipts = Arc::new(
        ReceiptService::new(
            Keypair::from_seed_b64(&seed).context("rebuild receipt signing key")?,
            Arc::new(store),
        )
        .with_worm(WormSink::new(data_dir.join("worm"))),
    );

    let bus = EventBus::new(BusConfig {
        retention_age: chrono::Duration::days(config.event_bus.stream_retention_days as i64),
        max_deliver: config.event_bus.max_deliver,
        dlq_subject: config.event_bus.dlq_subject.clone(),
        ..BusConfig::default()
    });

    let registry = Arc::new(MemoryRegistry::new());
    let compiler = PlanCompiler::new(Arc::clone(&registry) as _);
    let simulator = PreflightSimulator::new(Arc::new(MockToolRegistry::new()));
    let approvals = ApprovalsBridge::new();

    let mut observers = ObserverRegistry::new();
    observers.register(Box::new(TracingObserver));

    let orchestrator = Orchestrator::new(Dependencies {
        compiler: compiler.clone(),
        tokens: Arc::clone(&tokens),
        approvals: approvals.clone(),
        receipts: Arc::clone(&receipts),
        bus: bus.clone(),
        engines,
        observers,
        config: config.clone(),
    });

    Ok(Arc::new(AppState {
        orchestrator,
        compiler,
        simulator,
        tokens,
        receipts,
        approvals,
        registry,
        bus,
        default_approval_deadline_secs: config.approval.default_deadline_seconds,
        reported_ghostruns: std::sync::Mutex::new(std::collections::HashSet::new()),
        started_at: Instant::now(),
    }))
}

/// Start background tasks (the approval deadline sweeper).
pub fn spawn_background(state: &Arc<AppState>) -> tokio::task::JoinHandle<()> {
    state
        .approvals
        .spawn_sweeper(std::time::Duration::from_secs(1))
}

/// Build the Axum router with all routes and the middleware pipeline.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/v1/captokens", post(api::issue_token))
        .route("/v1/captokens/verify", post(api::verify_token))
        .route("/v1/captokens/refresh", post(api::refresh_token))
        .route("/v1/captokens/revoke", post(api::revoke_token))
        .route("/v1/capsules", post(api::register_capsule))
        .route("/v1/capsules/{capsule_id}", get(api::get_capsule))
        .route("/v1/compile", post(api::compile))
        .route("/v1/plans/{plan_hash}", get(api::get_plan))
        .route("/v1/ghostrun", post(api::start_ghostrun))
        .route("/v1/ghostrun/{run_id}", get(api::ghostrun_status))
        .route("/v1/ghostrun/{run_id}/report", get(api::ghostrun_report))
        .route("/v1/execute", post(api::execute))
        .route("/v1/executions/{run_id}", get(api::get_execution))
        .route("/v1/executions/{run_id}/{action}", post(api::control_execution))
        .route("/v1/approvals", post(api::create_approval))
        .route("/v1/approvals/{approval_id}", get(api::get_approval))
        .route("/v1/approvals/{approval_id}/delegate", post(api::delegate_approval))
        .route("/v1/approvals/{approval_id}/{action}", post(api::decide_approval))
        .route("/v1/receipts", post(api::create_receipt))
        .route("/v1/receipts/audit", get(api::receipt_audit))
        .route("/v1/receipts/{receipt_id}/verify", post(api::verify_receipt))
        .layer(axum_middleware::from_fn(middleware::context_middleware))
        .layer(axum_middleware::from_fn(middleware::request_logger))
        .with_state(state)
}
