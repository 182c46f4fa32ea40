// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable error codes for the control plane.
//!
//! Every user-visible failure carries an [`ErrorCode`] (a machine-readable,
//! stable string tag) that belongs to exactly one [`ErrorKind`], the closed
//! set of outcomes a caller can act on. Kinds map one-to-one onto HTTP
//! statuses; codes are free to grow without breaking that mapping. Use the
//! builder returned by [`CpError::new`] to construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// The closed set of user-facing failure kinds.
///
/// Callers branch on the kind, never on individual codes: retryability and
/// HTTP status are decided here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input or schema failure; not retried.
    Validation,
    /// Capability missing, invalid, or expired; not retried.
    Unauthorized,
    /// Idempotency or state-machine conflict; not retried automatically.
    Conflict,
    /// Policy or approval rejection; not retried.
    Denied,
    /// A referenced plan, run, or receipt does not exist.
    NotFound,
    /// Network or dependency unavailability; retryable per policy.
    Transient,
    /// Invariant violation; never retried silently, always logged with a
    /// correlation id.
    Internal,
}

impl ErrorKind {
    /// The HTTP status this kind maps onto.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Unauthorized => 401,
            Self::Denied => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Transient => 503,
            Self::Internal => 500,
        }
    }

    /// Whether a caller may retry the failed operation as-is.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Unauthorized => "unauthorized",
            Self::Conflict => "conflict",
            Self::Denied => "denied",
            Self::NotFound => "not_found",
            Self::Transient => "transient",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Validation --
    /// A capsule or request body failed structural or business validation.
    InvalidCapsule,
    /// A requested token TTL exceeds the hard maximum.
    InvalidTtl,
    /// A request was malformed at the transport layer.
    InvalidRequest,

    // -- Unauthorized --
    /// A capability token failed signature or audience checks.
    TokenInvalid,
    /// A capability token is past its expiry.
    TokenExpired,
    /// A token's unique id was presented more than once.
    ReplayDetected,
    /// The token lacks a capability the operation requires.
    CapabilityMissing,

    // -- Conflict --
    /// The same idempotency key was reused with a different request body.
    IdempotencyConflict,
    /// A run was asked to make a transition its current state forbids.
    InvalidStateTransition,
    /// The receipt chain head moved underneath a writer.
    ChainHeadContention,
    /// Capsule dependencies form a cycle.
    CycleDetected,
    /// A capsule already exists at this (name, version).
    CapsuleExists,

    // -- Denied --
    /// An approver rejected the run.
    ApprovalRejected,
    /// An approval deadline passed with no escalation target left.
    ApprovalExpired,
    /// A plan step violated the security context at validation time.
    PolicyViolation,

    // -- NotFound --
    /// No capsule exists with the requested id for the tenant.
    CapsuleNotFound,
    /// No compiled plan exists for the requested hash.
    PlanNotFound,
    /// No run exists with the requested id.
    RunNotFound,
    /// No receipt exists with the requested id.
    ReceiptNotFound,
    /// No capsule dependency satisfies a reference.
    DependencyNotFound,
    /// No approval exists with the requested id.
    ApprovalNotFound,

    // -- Transient --
    /// The tool endpoint was unreachable or returned a retryable failure.
    ToolUnavailable,
    /// The tenant is at its concurrent-run bound.
    ServiceBusy,

    // -- Internal --
    /// Catch-all for invariant violations.
    Internal,
}

impl ErrorCode {
    /// Returns the [`ErrorKind`] this code belongs to.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidCapsule | Self::InvalidTtl | Self::InvalidRequest => ErrorKind::Validation,

            Self::TokenInvalid
            | Self::TokenExpired
            | Self::ReplayDetected
            | Self::CapabilityMissing => ErrorKind::Unauthorized,

            Self::IdempotencyConflict
            | Self::InvalidStateTransition
            | Self::ChainHeadContention
            | Self::CycleDetected
            | Self::CapsuleExists => ErrorKind::Conflict,

            Self::ApprovalRejected | Self::ApprovalExpired | Self::PolicyViolation => {
                ErrorKind::Denied
            }

            Self::CapsuleNotFound
            | Self::PlanNotFound
            | Self::RunNotFound
            | Self::ReceiptNotFound
            | Self::DependencyNotFound
            | Self::ApprovalNotFound => ErrorKind::NotFound,

            Self::ToolUnavailable | Self::ServiceBusy => ErrorKind::Transient,

            Self::Internal => ErrorKind::Internal,
        }
    }

    /// Stable `&'static str` representation (e.g. `"REPLAY_DETECTED"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidCapsule => "INVALID_CAPSULE",
            Self::InvalidTtl => "INVALID_TTL",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::ReplayDetected => "REPLAY_DETECTED",
            Self::CapabilityMissing => "CAPABILITY_MISSING",
            Self::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            Self::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            Self::ChainHeadContention => "CHAIN_HEAD_CONTENTION",
            Self::CycleDetected => "CYCLE_DETECTED",
            Self::CapsuleExists => "CAPSULE_EXISTS",
            Self::CapsuleNotFound => "CAPSULE_NOT_FOUND",
            Self::ApprovalRejected => "APPROVAL_REJECTED",
            Self::ApprovalExpired => "APPROVAL_EXPIRED",
            Self::PolicyViolation => "POLICY_VIOLATION",
            Self::PlanNotFound => "PLAN_NOT_FOUND",
            Self::RunNotFound => "RUN_NOT_FOUND",
            Self::ReceiptNotFound => "RECEIPT_NOT_FOUND",
            Self::DependencyNotFound => "DEPENDENCY_NOT_FOUND",
            Self::ApprovalNotFound => "APPROVAL_NOT_FOUND",
            Self::ToolUnavailable => "TOOL_UNAVAILABLE",
            Self::ServiceBusy => "SERVICE_BUSY",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CpError
// ---------------------------------------------------------------------------

/// Unified control-plane error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use acp_error::{CpError, ErrorCode};
///
/// let err = CpError::new(ErrorCode::ToolUnavailable, "endpoint refused connection")
///     .with_context("tool", "demo_tool")
///     .with_context("attempt", 2);
/// assert!(err.kind().is_retryable());
/// ```
pub struct CpError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl CpError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.kind()`.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }
}

impl fmt::Debug for CpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("CpError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for CpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for CpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`CpError`] (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&CpError> for CpErrorDto {
    fn from(err: &CpError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<CpErrorDto> for CpError {
    fn from(dto: CpErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
