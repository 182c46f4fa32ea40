// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end HTTP tests against the full router with a mock engine.

use acp_config::ControlPlaneConfig;
use acp_gateway::{AppState, build_router, build_state};
use acp_toolproto::{MockToolTransport, ToolTransport};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Gateway {
    router: Router,
    state: Arc<AppState>,
    _data_dir: tempfile::TempDir,
}

fn gateway() -> Gateway {
    let data_dir = tempfile::tempdir().unwrap();
    let mut config = ControlPlaneConfig::default();
    config.server.data_dir = data_dir.path().display().to_string();
    config.retry.base_delay_ms = 5;
    config.retry.max_delay_ms = 20;

    let mut engines: HashMap<String, Arc<dyn ToolTransport>> = HashMap::new();
    engines.insert("demo_tool".into(), Arc::new(MockToolTransport::new()));

    let state = build_state(&config, engines).unwrap();
    Gateway {
        router: build_router(Arc::clone(&state)),
        state,
        _data_dir: data_dir,
    }
}

async fn send(
    router: &Router,
    method: &str,
    path: &str,
    tenant: Option<&str>,
    headers: &[(&str, &str)],
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(tenant) = tenant {
        builder = builder.header("x-tenant-id", tenant);
    }
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

const CAPSULE_YAML: &str = r"
name: invoice-sync
version: 1.0.0
steps:
  - name: fetch
    tool: http_get
  - name: store
    tool: db_upsert
    depends_on: [fetch]
";

async fn compile_plan(g: &Gateway, tenant: &str) -> String {
    let (status, body) = send(
        &g.router,
        "POST",
        "/v1/compile",
        Some(tenant),
        &[],
        Some(json!({ "capsule": CAPSULE_YAML })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "compile failed: {body}");
    body["plan_hash"].as_str().unwrap().to_string()
}

async fn wait_for_run_status(g: &Gateway, tenant: &str, run_id: &str, wanted: &str) -> Value {
    for _ in 0..300 {
        let (status, body) = send(
            &g.router,
            "GET",
            &format!("/v1/executions/{run_id}"),
            Some(tenant),
            &[],
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        if body["status"] == wanted {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run never reached {wanted}");
}

// ---------------------------------------------------------------------------
// Health and middleware
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_needs_no_tenant() {
    let g = gateway();
    let (status, body) = send(&g.router, "GET", "/health", None, &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["contract_version"], acp_core::CONTRACT_VERSION);
}

#[tokio::test]
async fn missing_tenant_header_yields_problem() {
    let g = gateway();
    let (status, body) = send(&g.router, "POST", "/v1/compile", None, &[], Some(json!({"capsule": ""}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], 400);
    assert_eq!(body["title"], "validation");
    assert!(body["type"].as_str().unwrap().contains("INVALID_REQUEST"));
    assert!(body["correlation_id"].is_string());
}

#[tokio::test]
async fn correlation_id_is_echoed() {
    let g = gateway();
    let id = uuid::Uuid::new_v4().to_string();
    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .header("x-correlation-id", &id)
        .body(Body::empty())
        .unwrap();
    let response = g.router.clone().oneshot(request).await.unwrap();
    assert_eq!(
        response.headers().get("x-correlation-id").unwrap().to_str().unwrap(),
        id
    );
}

// ---------------------------------------------------------------------------
// Capability tokens
// ---------------------------------------------------------------------------

#[tokio::test]
async fn captoken_issue_verify_replay() {
    let g = gateway();
    let (status, body) = send(
        &g.router,
        "POST",
        "/v1/captokens",
        Some("T1"),
        &[],
        Some(json!({ "subject": "svc", "capabilities": ["read"], "ttl_secs": 60 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().unwrap().to_string();

    let (status, body) = send(
        &g.router,
        "POST",
        "/v1/captokens/verify",
        Some("T1"),
        &[],
        Some(json!({ "token": token })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["claims"]["sub"], "svc");

    // Second verification: replay, per the route table a 409.
    let (status, body) = send(
        &g.router,
        "POST",
        "/v1/captokens/verify",
        Some("T1"),
        &[],
        Some(json!({ "token": token })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["type"].as_str().unwrap().contains("REPLAY_DETECTED"));
}

#[tokio::test]
async fn captoken_ttl_ceiling_is_400() {
    let g = gateway();
    let (status, body) = send(
        &g.router,
        "POST",
        "/v1/captokens",
        Some("T1"),
        &[],
        Some(json!({ "subject": "svc", "capabilities": [], "ttl_secs": 301 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["type"].as_str().unwrap().contains("INVALID_TTL"));
}

#[tokio::test]
async fn captoken_cross_tenant_verify_fails() {
    let g = gateway();
    let (_, body) = send(
        &g.router,
        "POST",
        "/v1/captokens",
        Some("T1"),
        &[],
        Some(json!({ "subject": "svc", "capabilities": [], "ttl_secs": 60 })),
    )
    .await;
    let token = body["token"].as_str().unwrap().to_string();

    let (status, _) = send(
        &g.router,
        "POST",
        "/v1/captokens/verify",
        Some("T2"),
        &[],
        Some(json!({ "token": token })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// ---------------------------------------------------------------------------
// Capsules
// ---------------------------------------------------------------------------

#[tokio::test]
async fn capsules_are_tenant_isolated() {
    let g = gateway();
    let (status, created) = send(
        &g.router,
        "POST",
        "/v1/capsules",
        Some("T1"),
        &[],
        Some(json!({ "capsule": CAPSULE_YAML })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "register failed: {created}");
    let capsule_id = created["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &g.router,
        "GET",
        &format!("/v1/capsules/{capsule_id}"),
        Some("T1"),
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "invoice-sync");

    // Under another tenant the capsule does not exist.
    let (status, _) = send(
        &g.router,
        "GET",
        &format!("/v1/capsules/{capsule_id}"),
        Some("T2"),
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn duplicate_capsule_registration_conflicts() {
    let g = gateway();
    let body = json!({ "capsule": CAPSULE_YAML });
    let (status, _) = send(&g.router, "POST", "/v1/capsules", Some("T1"), &[], Some(body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let (status, problem) = send(&g.router, "POST", "/v1/capsules", Some("T1"), &[], Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(problem["type"].as_str().unwrap().contains("CAPSULE_EXISTS"));
}

// ---------------------------------------------------------------------------
// Compile & plans
// ---------------------------------------------------------------------------

#[tokio::test]
async fn compile_then_fetch_plan() {
    let g = gateway();
    let plan_hash = compile_plan(&g, "T1").await;

    let (status, body) = send(
        &g.router,
        "GET",
        &format!("/v1/plans/{plan_hash}"),
        Some("T1"),
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["compiled_plan"]["plan_hash"], plan_hash);
}

#[tokio::test]
async fn plans_are_tenant_isolated() {
    let g = gateway();
    let plan_hash = compile_plan(&g, "T1").await;

    // Another tenant must see a 404, not the plan.
    let (status, _) = send(
        &g.router,
        "GET",
        &format!("/v1/plans/{plan_hash}"),
        Some("T2"),
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_capsule_is_400() {
    let g = gateway();
    let (status, body) = send(
        &g.router,
        "POST",
        "/v1/compile",
        Some("T1"),
        &[],
        Some(json!({ "capsule": "name: BAD NAME\nversion: nope\nsteps: []" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["type"].as_str().unwrap().contains("INVALID_CAPSULE"));
}

// ---------------------------------------------------------------------------
// Ghost runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ghostrun_produces_a_report() {
    let g = gateway();
    let plan_hash = compile_plan(&g, "T1").await;

    let (status, body) = send(
        &g.router,
        "POST",
        "/v1/ghostrun",
        Some("T1"),
        &[],
        Some(json!({ "plan_hash": plan_hash, "config": { "max_parallelism": 2, "seed": 7 } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let run_id = body["run_id"].as_str().unwrap().to_string();

    for _ in 0..300 {
        let (status, body) = send(
            &g.router,
            "GET",
            &format!("/v1/ghostrun/{run_id}"),
            Some("T1"),
            &[],
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        if body["status"] == "completed" {
            let (status, report) = send(
                &g.router,
                "GET",
                &format!("/v1/ghostrun/{run_id}/report"),
                Some("T1"),
                &[],
                None,
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(report["report"]["plan_hash"], plan_hash);
            assert_eq!(report["report"]["steps"].as_array().unwrap().len(), 2);
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("simulation never completed");
}

#[tokio::test]
async fn ghostrun_is_tenant_isolated() {
    let g = gateway();
    let plan_hash = compile_plan(&g, "T1").await;
    let (_, body) = send(
        &g.router,
        "POST",
        "/v1/ghostrun",
        Some("T1"),
        &[],
        Some(json!({ "plan_hash": plan_hash })),
    )
    .await;
    let run_id = body["run_id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &g.router,
        "GET",
        &format!("/v1/ghostrun/{run_id}"),
        Some("T2"),
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Execute scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn execute_happy_path_with_receipt() {
    let g = gateway();
    let plan_hash = compile_plan(&g, "T1").await;

    let (status, accepted) = send(
        &g.router,
        "POST",
        "/v1/execute",
        Some("T1"),
        &[("idempotency-key", "k-1")],
        Some(json!({
            "plan_hash": plan_hash,
            "engine": "demo_tool",
            "parameters": { "x": 1 },
            "require_approval": false,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let run_id = accepted["run_id"].as_str().unwrap().to_string();

    let run = wait_for_run_status(&g, "T1", &run_id, "succeeded").await;
    let receipt_id = run["receipt_id"].as_str().unwrap().to_string();
    assert_eq!(run["plan_hash"], plan_hash);

    let (status, verification) = send(
        &g.router,
        "POST",
        &format!("/v1/receipts/{receipt_id}/verify"),
        Some("T1"),
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verification["valid"], true);

    // The completion event carries the run and plan identifiers.
    let events = g.state.bus.events_matching("events.execution.completed");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event.data["run_id"], run_id);
    assert_eq!(events[0].event.data["plan_hash"], plan_hash);
}

#[tokio::test]
async fn execute_idempotent_replay_and_conflict() {
    let g = gateway();
    let plan_hash = compile_plan(&g, "T1").await;
    let body = json!({
        "plan_hash": plan_hash,
        "engine": "demo_tool",
        "parameters": { "x": 1 },
        "require_approval": false,
    });

    let (_, first) = send(
        &g.router,
        "POST",
        "/v1/execute",
        Some("T1"),
        &[("idempotency-key", "k-1")],
        Some(body.clone()),
    )
    .await;
    let run_id = first["run_id"].as_str().unwrap().to_string();
    wait_for_run_status(&g, "T1", &run_id, "succeeded").await;

    // Identical body, same key: same run, no new work.
    let (status, replay) = send(
        &g.router,
        "POST",
        "/v1/execute",
        Some("T1"),
        &[("idempotency-key", "k-1")],
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(replay["run_id"], run_id.as_str());
    assert_eq!(replay["replayed"], true);

    // Different body, same key: conflict.
    let (status, problem) = send(
        &g.router,
        "POST",
        "/v1/execute",
        Some("T1"),
        &[("idempotency-key", "k-1")],
        Some(json!({
            "plan_hash": plan_hash,
            "engine": "demo_tool",
            "parameters": { "x": 2 },
            "require_approval": false,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(problem["type"].as_str().unwrap().contains("IDEMPOTENCY_CONFLICT"));
}

#[tokio::test]
async fn execute_with_approval_gate() {
    let g = gateway();
    let plan_hash = compile_plan(&g, "T1").await;

    let (status, accepted) = send(
        &g.router,
        "POST",
        "/v1/execute",
        Some("T1"),
        &[],
        Some(json!({
            "plan_hash": plan_hash,
            "engine": "demo_tool",
            "require_approval": true,
            "approvers": ["alice"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let run_id = accepted["run_id"].as_str().unwrap().to_string();

    let run = wait_for_run_status(&g, "T1", &run_id, "awaiting_approval").await;
    let approval_id = run["approval_ids"][0].as_str().unwrap().to_string();

    let (status, _) = send(
        &g.router,
        "POST",
        &format!("/v1/approvals/{approval_id}/approve"),
        Some("T1"),
        &[],
        Some(json!({ "actor": "alice", "reason": "reviewed" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    wait_for_run_status(&g, "T1", &run_id, "succeeded").await;
    assert_eq!(g.state.bus.events_matching("events.approval.granted").len(), 1);
}

#[tokio::test]
async fn executions_are_tenant_isolated() {
    let g = gateway();
    let plan_hash = compile_plan(&g, "T1").await;
    let (_, accepted) = send(
        &g.router,
        "POST",
        "/v1/execute",
        Some("T1"),
        &[],
        Some(json!({ "plan_hash": plan_hash, "engine": "demo_tool" })),
    )
    .await;
    let run_id = accepted["run_id"].as_str().unwrap().to_string();
    wait_for_run_status(&g, "T1", &run_id, "succeeded").await;

    let (status, _) = send(
        &g.router,
        "GET",
        &format!("/v1/executions/{run_id}"),
        Some("T2"),
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_unknown_run_is_404() {
    let g = gateway();
    let (status, _) = send(
        &g.router,
        "POST",
        &format!("/v1/executions/{}/cancel", uuid::Uuid::new_v4()),
        Some("T1"),
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn receipt_audit_lists_tenant_chain() {
    let g = gateway();
    let plan_hash = compile_plan(&g, "T1").await;
    for _ in 0..2 {
        let (_, accepted) = send(
            &g.router,
            "POST",
            "/v1/execute",
            Some("T1"),
            &[],
            Some(json!({ "plan_hash": plan_hash, "engine": "demo_tool" })),
        )
        .await;
        let run_id = accepted["run_id"].as_str().unwrap().to_string();
        wait_for_run_status(&g, "T1", &run_id, "succeeded").await;
    }

    let (status, audit) = send(&g.router, "GET", "/v1/receipts/audit", Some("T1"), &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(audit["total"], 2);
    assert_eq!(audit["chain_valid"], true);

    // Another tenant sees an empty audit trail.
    let (_, other) = send(&g.router, "GET", "/v1/receipts/audit", Some("T2"), &[], None).await;
    assert_eq!(other["total"], 0);
}

#[tokio::test]
async fn manual_receipt_roundtrip() {
    let g = gateway();
    let (status, created) = send(
        &g.router,
        "POST",
        "/v1/receipts",
        Some("T1"),
        &[],
        Some(json!({
            "run_id": uuid::Uuid::new_v4(),
            "plan_hash": "abc123",
            "status": "succeeded",
            "results_digest": "0".repeat(64),
            "started_at": chrono::Utc::now().to_rfc3339(),
            "completed_at": chrono::Utc::now().to_rfc3339(),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "create receipt failed: {created}");
    let receipt_id = created["receipt_id"].as_str().unwrap().to_string();

    let (status, verification) = send(
        &g.router,
        "POST",
        &format!("/v1/receipts/{receipt_id}/verify"),
        Some("T1"),
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verification["valid"], true);

    // Receipts are invisible across tenants.
    let (status, _) = send(
        &g.router,
        "POST",
        &format!("/v1/receipts/{receipt_id}/verify"),
        Some("T2"),
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
