// SPDX-License-Identifier: MIT OR Apache-2.0
//! Client for the remote streaming tool protocol.
//!
//! A session is one negotiated exchange with the external agent runtime:
//! version handshake first, then tool invocations. Every invocation carries
//! the run's capability token; responses stream zero or more chunks followed
//! by a final result frame. Cancellation is protocol-level where the
//! transport supports it.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Transports: the wire seam plus mock and HTTP implementations.
pub mod transport;
/// Version negotiation.
pub mod version;

pub use transport::{HttpToolTransport, MockToolTransport, ToolTransport};
pub use version::{PROTOCOL_VERSION, ProtocolVersion, VersionError, negotiate_version};

use acp_error::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from tool-protocol exchanges.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolProtoError {
    /// Version negotiation failed.
    #[error(transparent)]
    Version(#[from] VersionError),

    /// The transport failed (connection refused, timeout, 5xx). Retryable.
    #[error("tool transport failure: {0}")]
    Transport(String),

    /// The tool reported a failure.
    #[error("tool failed: {message}")]
    Tool {
        /// Tool-reported message.
        message: String,
        /// Whether the endpoint marked the failure safe to retry.
        retryable: bool,
    },

    /// The invocation deadline elapsed.
    #[error("tool invocation timed out")]
    Timeout,

    /// The invocation was cancelled.
    #[error("tool invocation cancelled")]
    Cancelled,

    /// The endpoint answered with a frame the protocol does not allow here.
    #[error("unexpected protocol frame: {0}")]
    UnexpectedFrame(String),
}

impl ToolProtoError {
    /// Whether retrying the same exchange may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout => true,
            Self::Tool { retryable, .. } => *retryable,
            Self::Version(_) | Self::Cancelled | Self::UnexpectedFrame(_) => false,
        }
    }

    /// The stable error code for this failure.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Transport(_) | Self::Timeout | Self::Tool { .. } => ErrorCode::ToolUnavailable,
            Self::Version(_) | Self::UnexpectedFrame(_) => ErrorCode::Internal,
            Self::Cancelled => ErrorCode::InvalidStateTransition,
        }
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// One NDJSON frame of the tool protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolFrame {
    /// Client → endpoint: open a session.
    Hello {
        /// Version the client offers.
        version: String,
        /// Capability token authorizing the session.
        capability_token: String,
    },
    /// Endpoint → client: session accepted.
    HelloAck {
        /// Version the endpoint answers with.
        version: String,
    },
    /// Client → endpoint: invoke a tool.
    Invoke {
        /// Correlates chunks and result to this invocation.
        invocation_id: Uuid,
        /// Tool name.
        tool: String,
        /// Tool parameters.
        parameters: BTreeMap<String, Value>,
        /// Idempotency key passed through to the tool, when the caller has
        /// one. Its presence marks the call safe to retry end-to-end.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        idempotency_key: Option<String>,
        /// Deadline for the invocation in milliseconds.
        deadline_ms: u64,
    },
    /// Endpoint → client: one streamed partial payload.
    Chunk {
        /// The invocation this chunk belongs to.
        invocation_id: Uuid,
        /// Partial payload.
        data: Value,
    },
    /// Endpoint → client: terminal result of an invocation.
    Result {
        /// The invocation this result closes.
        invocation_id: Uuid,
        /// Whether the tool succeeded.
        success: bool,
        /// Output payload on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        /// Failure message.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Whether the endpoint marks the failure retryable.
        #[serde(default)]
        retryable: bool,
    },
    /// Client → endpoint: cancel an in-flight invocation.
    Cancel {
        /// The invocation to cancel.
        invocation_id: Uuid,
    },
}

/// Encode a frame as one NDJSON line.
///
/// # Errors
///
/// Returns [`ToolProtoError::UnexpectedFrame`] if serialization fails.
pub fn encode_frame(frame: &ToolFrame) -> Result<String, ToolProtoError> {
    let mut line = serde_json::to_string(frame)
        .map_err(|e| ToolProtoError::UnexpectedFrame(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// Decode NDJSON lines into frames, skipping blank lines.
///
/// # Errors
///
/// Returns [`ToolProtoError::UnexpectedFrame`] on any undecodable line.
pub fn decode_frames(raw: &str) -> Result<Vec<ToolFrame>, ToolProtoError> {
    raw.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            serde_json::from_str(l).map_err(|e| ToolProtoError::UnexpectedFrame(e.to_string()))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// The terminal outcome of one invocation, with any streamed chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    /// The invocation id.
    pub invocation_id: Uuid,
    /// Streamed partial payloads, in arrival order.
    pub chunks: Vec<Value>,
    /// Final output payload.
    pub output: Value,
}

/// A negotiated session against a tool endpoint.
pub struct ToolSession {
    transport: Arc<dyn ToolTransport>,
    /// The version both peers agreed on.
    pub version: ProtocolVersion,
    capability_token: String,
}

impl std::fmt::Debug for ToolSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSession")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl ToolSession {
    /// Open a session: send `Hello`, negotiate the version from the ack.
    ///
    /// # Errors
    ///
    /// - [`ToolProtoError::Version`] on incompatible versions.
    /// - [`ToolProtoError::Transport`] on exchange failure.
    /// - [`ToolProtoError::UnexpectedFrame`] when the endpoint answers with
    ///   anything but a `HelloAck`.
    pub async fn connect(
        transport: Arc<dyn ToolTransport>,
        capability_token: &str,
    ) -> Result<Self, ToolProtoError> {
        let local = ProtocolVersion::current();
        let hello = ToolFrame::Hello {
            version: local.to_string(),
            capability_token: capability_token.to_string(),
        };
        let frames = transport.exchange(hello).await?;
        let [ToolFrame::HelloAck { version }] = frames.as_slice() else {
            return Err(ToolProtoError::UnexpectedFrame(
                "expected a single hello_ack".into(),
            ));
        };
        let remote = ProtocolVersion::parse(version)?;
        let version = negotiate_version(local, remote)?;
        debug!(target: "acp.toolproto", %version, "session negotiated");

        Ok(Self {
            transport,
            version,
            capability_token: capability_token.to_string(),
        })
    }

    /// Invoke `tool`, collecting streamed chunks until the result frame.
    ///
    /// # Errors
    ///
    /// See [`ToolProtoError`]; failures marked retryable by the endpoint keep
    /// that marking.
    pub async fn invoke(
        &self,
        tool: &str,
        parameters: &BTreeMap<String, Value>,
        idempotency_key: Option<String>,
        deadline_ms: u64,
    ) -> Result<ToolOutcome, ToolProtoError> {
        let invocation_id = Uuid::new_v4();
        let invoke = ToolFrame::Invoke {
            invocation_id,
            tool: tool.to_string(),
            parameters: parameters.clone(),
            idempotency_key,
            deadline_ms,
        };

        let deadline = std::time::Duration::from_millis(deadline_ms);
        let frames = match tokio::time::timeout(deadline, self.transport.exchange(invoke)).await {
            Ok(result) => result?,
            Err(_) => {
                // Best-effort protocol-level cancellation of the abandoned call.
                let _ = self
                    .transport
                    .exchange(ToolFrame::Cancel { invocation_id })
                    .await;
                warn!(target: "acp.toolproto", tool, %invocation_id, "invocation timed out");
                return Err(ToolProtoError::Timeout);
            }
        };

        let mut chunks = Vec::new();
        for frame in frames {
            match frame {
                ToolFrame::Chunk {
                    invocation_id: id,
                    data,
                } if id == invocation_id => chunks.push(data),
                ToolFrame::Result {
                    invocation_id: id,
                    success,
                    output,
                    error,
                    retryable,
                } if id == invocation_id => {
                    if success {
                        return Ok(ToolOutcome {
                            invocation_id,
                            chunks,
                            output: output.unwrap_or(Value::Null),
                        });
                    }
                    return Err(ToolProtoError::Tool {
                        message: error.unwrap_or_else(|| "unspecified tool failure".into()),
                        retryable,
                    });
                }
                other => {
                    return Err(ToolProtoError::UnexpectedFrame(format!("{other:?}")));
                }
            }
        }
        Err(ToolProtoError::Transport("stream ended without a result".into()))
    }

    /// Send a protocol-level cancellation for an invocation.
    ///
    /// # Errors
    ///
    /// Returns [`ToolProtoError::Transport`] when the exchange fails.
    pub async fn cancel(&self, invocation_id: Uuid) -> Result<(), ToolProtoError> {
        self.transport
            .exchange(ToolFrame::Cancel { invocation_id })
            .await?;
        Ok(())
    }

    /// The capability token this session carries.
    #[must_use]
    pub fn capability_token(&self) -> &str {
        &self.capability_token
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
