// SPDX-License-Identifier: MIT OR Apache-2.0
//! RFC 7807 problem responses.
//!
//! Every error leaving the HTTP surface is a `application/problem+json`
//! document carrying the stable error code, the kind-derived status, and the
//! request's correlation id. Internal details are redacted: the `detail`
//! string is what the component chose to surface, never a backtrace.

use acp_error::ErrorCode;
use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An RFC 7807 problem document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    /// URI-shaped identifier derived from the stable error code.
    #[serde(rename = "type")]
    pub problem_type: String,
    /// Short human-readable summary (the error kind).
    pub title: String,
    /// HTTP status.
    pub status: u16,
    /// Human-readable detail for this occurrence.
    pub detail: String,
    /// Correlation id of the failing request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl Problem {
    /// Build a problem from a stable error code.
    #[must_use]
    pub fn from_code(code: ErrorCode, detail: impl Into<String>, correlation_id: Option<Uuid>) -> Self {
        let kind = code.kind();
        Self {
            problem_type: format!("https://autoplane.dev/errors/{}", code.as_str()),
            title: kind.to_string(),
            status: kind.http_status(),
            detail: detail.into(),
            correlation_id,
        }
    }

    /// Override the HTTP status (endpoint tables may refine the kind default,
    /// e.g. 410 for expired tokens on the verify route).
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(&self)).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
