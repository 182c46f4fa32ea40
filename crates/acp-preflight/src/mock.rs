// SPDX-License-Identifier: MIT OR Apache-2.0
//! Mock tool registry for side-effect-free simulation.
//!
//! Each entry models one tool: a base latency (sampled ±30 % during
//! simulation), a risk level the failure probability derives from, and a
//! schema-typed response payload returned to the simulated step.

use acp_core::plan::RiskLevel;
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Simulated behavior for one tool.
#[derive(Debug, Clone)]
pub struct MockTool {
    /// Mean latency of the tool in milliseconds.
    pub base_latency_ms: u64,
    /// Risk level; drives the sampled failure probability.
    pub risk: RiskLevel,
    /// Response payload handed to the simulated step on success.
    pub response: Value,
}

impl MockTool {
    /// A mock with the given latency and risk and an empty response.
    #[must_use]
    pub fn new(base_latency_ms: u64, risk: RiskLevel) -> Self {
        Self {
            base_latency_ms,
            risk,
            response: json!({ "ok": true }),
        }
    }

    /// Replace the response payload.
    #[must_use]
    pub fn with_response(mut self, response: Value) -> Self {
        self.response = response;
        self
    }
}

/// Registry of mock tools keyed by tool name.
///
/// Unregistered tools fall back to a medium-risk default so that simulation
/// never fails merely because a connector has no mock yet.
#[derive(Debug, Clone)]
pub struct MockToolRegistry {
    tools: BTreeMap<String, MockTool>,
    fallback: MockTool,
}

impl MockToolRegistry {
    /// An empty registry with the default fallback.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
            fallback: MockTool::new(500, RiskLevel::Medium),
        }
    }

    /// Register (or replace) a mock for `tool`.
    pub fn register(&mut self, tool: impl Into<String>, mock: MockTool) {
        self.tools.insert(tool.into(), mock);
    }

    /// The mock for `tool`, or the fallback when none is registered.
    #[must_use]
    pub fn get(&self, tool: &str) -> &MockTool {
        self.tools.get(tool).unwrap_or(&self.fallback)
    }

    /// Returns `true` if a mock is explicitly registered for `tool`.
    #[must_use]
    pub fn contains(&self, tool: &str) -> bool {
        self.tools.contains_key(tool)
    }

    /// Number of explicitly registered mocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns `true` when no mocks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for MockToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
