// SPDX-License-Identifier: MIT OR Apache-2.0
//! Transports: the wire seam of the tool protocol.
//!
//! [`ToolTransport::exchange`] sends one client frame and returns the
//! endpoint's response frames in order (chunks before the result). The
//! [`MockToolTransport`] services tests and local development; the
//! [`HttpToolTransport`] speaks NDJSON over HTTP to a real agent runtime.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::version::PROTOCOL_VERSION;
use crate::{ToolFrame, ToolProtoError, decode_frames, encode_frame};

/// The wire seam: one request frame in, response frames out.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Send `frame` and collect the endpoint's response frames.
    ///
    /// # Errors
    ///
    /// Returns [`ToolProtoError::Transport`] for connection-level failures.
    async fn exchange(&self, frame: ToolFrame) -> Result<Vec<ToolFrame>, ToolProtoError>;
}

// ---------------------------------------------------------------------------
// Mock transport
// ---------------------------------------------------------------------------

/// Scripted behavior for one mocked tool.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Stream the chunks, then succeed with the output.
    Succeed {
        /// Chunks streamed before the result.
        chunks: Vec<Value>,
        /// Final output payload.
        output: Value,
    },
    /// Fail with a message; `retryable` is passed through.
    Fail {
        /// Failure message.
        message: String,
        /// Whether the failure is marked retryable.
        retryable: bool,
    },
    /// Fail transiently `remaining` times, then succeed with the output.
    FailTimesThenSucceed {
        /// Failures left before success (shared across clones).
        remaining: Arc<Mutex<u32>>,
        /// Output once failures are exhausted.
        output: Value,
    },
    /// Answer success after a fixed delay (drives pause/cancel paths).
    Delayed {
        /// Milliseconds before the result frame.
        delay_ms: u64,
        /// Output payload.
        output: Value,
    },
    /// Never answer (drives timeout paths).
    Hang,
}

impl MockBehavior {
    /// Succeed immediately with `output` and no chunks.
    #[must_use]
    pub fn succeed(output: Value) -> Self {
        Self::Succeed {
            chunks: Vec::new(),
            output,
        }
    }

    /// Stream `chunks`, then succeed with `output`.
    #[must_use]
    pub fn succeed_with_chunks(chunks: Vec<Value>, output: Value) -> Self {
        Self::Succeed { chunks, output }
    }

    /// Fail with `message`.
    #[must_use]
    pub fn fail(message: impl Into<String>, retryable: bool) -> Self {
        Self::Fail {
            message: message.into(),
            retryable,
        }
    }

    /// Fail `times` times (retryably), then succeed with `output`.
    #[must_use]
    pub fn fail_times_then_succeed(times: u32, output: Value) -> Self {
        Self::FailTimesThenSucceed {
            remaining: Arc::new(Mutex::new(times)),
            output,
        }
    }

    /// Succeed with `output` after `delay_ms`.
    #[must_use]
    pub fn succeed_after(delay_ms: u64, output: Value) -> Self {
        Self::Delayed { delay_ms, output }
    }

    /// Never answer.
    #[must_use]
    pub fn hang() -> Self {
        Self::Hang
    }
}

/// In-process endpoint scripted per tool name.
///
/// Unscripted tools succeed with `{"ok": true}`.
pub struct MockToolTransport {
    remote_version: String,
    tools: HashMap<String, MockBehavior>,
    cancelled: Mutex<Vec<Uuid>>,
    invocations: Mutex<Vec<String>>,
}

impl MockToolTransport {
    /// A transport that speaks the current protocol version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            remote_version: PROTOCOL_VERSION.to_string(),
            tools: HashMap::new(),
            cancelled: Mutex::new(Vec::new()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Pretend the endpoint runs `version`.
    #[must_use]
    pub fn with_remote_version(mut self, version: impl Into<String>) -> Self {
        self.remote_version = version.into();
        self
    }

    /// Script `tool` with `behavior`.
    #[must_use]
    pub fn with_tool(mut self, tool: impl Into<String>, behavior: MockBehavior) -> Self {
        self.tools.insert(tool.into(), behavior);
        self
    }

    /// Invocation ids the client cancelled.
    #[must_use]
    pub fn cancelled_invocations(&self) -> Vec<Uuid> {
        self.cancelled.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Tool names invoked, in order.
    #[must_use]
    pub fn invoked_tools(&self) -> Vec<String> {
        self.invocations.lock().map(|i| i.clone()).unwrap_or_default()
    }
}

impl Default for MockToolTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolTransport for MockToolTransport {
    async fn exchange(&self, frame: ToolFrame) -> Result<Vec<ToolFrame>, ToolProtoError> {
        match frame {
            ToolFrame::Hello { .. } => Ok(vec![ToolFrame::HelloAck {
                version: self.remote_version.clone(),
            }]),
            ToolFrame::Cancel { invocation_id } => {
                if let Ok(mut cancelled) = self.cancelled.lock() {
                    cancelled.push(invocation_id);
                }
                Ok(Vec::new())
            }
            ToolFrame::Invoke {
                invocation_id,
                tool,
                ..
            } => {
                if let Ok(mut invocations) = self.invocations.lock() {
                    invocations.push(tool.clone());
                }
                match self.tools.get(&tool) {
                    None => Ok(vec![ToolFrame::Result {
                        invocation_id,
                        success: true,
                        output: Some(serde_json::json!({ "ok": true })),
                        error: None,
                        retryable: false,
                    }]),
                    Some(MockBehavior::Succeed { chunks, output }) => {
                        let mut frames: Vec<ToolFrame> = chunks
                            .iter()
                            .map(|data| ToolFrame::Chunk {
                                invocation_id,
                                data: data.clone(),
                            })
                            .collect();
                        frames.push(ToolFrame::Result {
                            invocation_id,
                            success: true,
                            output: Some(output.clone()),
                            error: None,
                            retryable: false,
                        });
                        Ok(frames)
                    }
                    Some(MockBehavior::Fail { message, retryable }) => Ok(vec![ToolFrame::Result {
                        invocation_id,
                        success: false,
                        output: None,
                        error: Some(message.clone()),
                        retryable: *retryable,
                    }]),
                    Some(MockBehavior::FailTimesThenSucceed { remaining, output }) => {
                        let failures_left = {
                            let Ok(mut remaining) = remaining.lock() else {
                                return Err(ToolProtoError::Transport("mock lock poisoned".into()));
                            };
                            if *remaining > 0 {
                                *remaining -= 1;
                                true
                            } else {
                                false
                            }
                        };
                        if failures_left {
                            Ok(vec![ToolFrame::Result {
                                invocation_id,
                                success: false,
                                output: None,
                                error: Some("transient failure".into()),
                                retryable: true,
                            }])
                        } else {
                            Ok(vec![ToolFrame::Result {
                                invocation_id,
                                success: true,
                                output: Some(output.clone()),
                                error: None,
                                retryable: false,
                            }])
                        }
                    }
                    Some(MockBehavior::Delayed { delay_ms, output }) => {
                        tokio::time::sleep(std::time::Duration::from_millis(*delay_ms)).await;
                        Ok(vec![ToolFrame::Result {
                            invocation_id,
                            success: true,
                            output: Some(output.clone()),
                            error: None,
                            retryable: false,
                        }])
                    }
                    Some(MockBehavior::Hang) => {
                        std::future::pending::<()>().await;
                        unreachable!("pending future never resolves")
                    }
                }
            }
            other => Err(ToolProtoError::UnexpectedFrame(format!("{other:?}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

/// NDJSON-over-HTTP transport to a real agent runtime endpoint.
///
/// Each exchange POSTs one frame and reads the response body as NDJSON
/// frames. Connection-level failures and non-2xx statuses surface as
/// [`ToolProtoError::Transport`], which the orchestrator treats as
/// retryable.
pub struct HttpToolTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpToolTransport {
    /// Create a transport against `endpoint`.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ToolTransport for HttpToolTransport {
    async fn exchange(&self, frame: ToolFrame) -> Result<Vec<ToolFrame>, ToolProtoError> {
        let body = encode_frame(&frame)?;
        let response = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| ToolProtoError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolProtoError::Transport(format!(
                "endpoint returned {status}"
            )));
        }
        let raw = response
            .text()
            .await
            .map_err(|e| ToolProtoError::Transport(e.to_string()))?;
        decode_frames(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_default_tool_succeeds() {
        let transport = MockToolTransport::new();
        let frames = transport
            .exchange(ToolFrame::Invoke {
                invocation_id: Uuid::nil(),
                tool: "anything".into(),
                parameters: std::collections::BTreeMap::new(),
                idempotency_key: None,
                deadline_ms: 1_000,
            })
            .await
            .unwrap();
        assert!(matches!(
            frames.as_slice(),
            [ToolFrame::Result { success: true, .. }]
        ));
        assert_eq!(transport.invoked_tools(), vec!["anything".to_string()]);
    }

    #[tokio::test]
    async fn mock_rejects_server_frames_from_client() {
        let transport = MockToolTransport::new();
        let err = transport
            .exchange(ToolFrame::HelloAck {
                version: PROTOCOL_VERSION.into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ToolProtoError::UnexpectedFrame(_)));
    }
}
