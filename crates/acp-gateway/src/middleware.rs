// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request pipeline: correlation ids, tenant context, request logging.
//!
//! Handlers never read headers themselves; the context middleware turns
//! `X-Tenant-ID` and `X-Correlation-ID` into a [`RequestContext`] extension,
//! rejecting tenant-less requests before any handler runs.

use acp_core::RequestContext;
use acp_error::ErrorCode;
use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

use crate::problem::Problem;

/// Header carrying the active tenant.
pub const TENANT_HEADER: &str = "x-tenant-id";
/// Header carrying (or returning) the correlation id.
pub const CORRELATION_HEADER: &str = "x-correlation-id";
/// Header carrying the idempotency key on execute requests.
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Paths served without a tenant context.
const PUBLIC_PATHS: &[&str] = &["/health"];

/// Build a [`RequestContext`] from headers and stash it as an extension.
///
/// Responds with a 400 problem when `X-Tenant-ID` is missing on a
/// non-public path. The correlation id is echoed on the response.
pub async fn context_middleware(mut req: Request, next: Next) -> Response {
    let correlation_id = req
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .unwrap_or_else(Uuid::new_v4);

    let public = PUBLIC_PATHS.contains(&req.uri().path());
    if !public {
        let tenant = req
            .headers()
            .get(TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let Some(tenant) = tenant else {
            return Problem::from_code(
                ErrorCode::InvalidRequest,
                format!("missing {TENANT_HEADER} header"),
                Some(correlation_id),
            )
            .into_response();
        };
        let ctx = RequestContext::with_correlation(tenant, correlation_id);
        req.extensions_mut().insert(ctx);
    }

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&correlation_id.to_string()) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

/// Log method, path, status, and latency for every request.
pub async fn request_logger(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let start = Instant::now();

    let response = next.run(req).await;

    info!(
        target: "acp.gateway",
        http_method = %method,
        http_path = %path,
        http_status = response.status().as_u16(),
        http_duration_ms = start.elapsed().as_millis() as u64,
        "request completed"
    );
    response
}
