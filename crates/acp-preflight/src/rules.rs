// SPDX-License-Identifier: MIT OR Apache-2.0
//! Heuristic recommendation rules applied to a simulated plan.

use acp_core::plan::{ExecutablePlan, RiskLevel};
use regex::Regex;
use std::sync::LazyLock;

/// Parameter values above this (in whole currency units) trigger a
/// high-cost recommendation.
const HIGH_COST_THRESHOLD: u64 = 1_000;

/// Timeouts above this are flagged as likely misconfigured.
const LARGE_TIMEOUT_MS: u64 = 600_000;

static SENSITIVE_PARAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(password|secret|token|api_?key|credential|private_key)")
        .expect("static sensitive-parameter pattern must compile")
});

static MONETARY_PARAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(amount|amount_cents|price|payment|charge)$")
        .expect("static monetary-parameter pattern must compile")
});

/// Derive recommendations for `plan`.
///
/// Purely rule-based and deterministic; the simulator appends these to the
/// preflight report unchanged.
#[must_use]
pub fn recommendations(plan: &ExecutablePlan) -> Vec<String> {
    let mut out = Vec::new();

    for step in &plan.steps {
        if step.max_retries == 0 && step.idempotent {
            out.push(format!(
                "step '{}' is idempotent but has no retries; consider max_retries >= 1",
                step.name
            ));
        }
        if step.timeout_ms >= LARGE_TIMEOUT_MS {
            out.push(format!(
                "step '{}' has a {}s timeout; tighten it to bound run duration",
                step.name,
                step.timeout_ms / 1_000
            ));
        }
        if step.risk >= RiskLevel::High && !step.requires_approval {
            out.push(format!(
                "step '{}' is {:?}-risk but has no approval gate",
                step.name, step.risk
            ));
        }

        for (key, value) in &step.parameters {
            if MONETARY_PARAM_RE.is_match(key)
                && value.as_u64().is_some_and(|v| v >= HIGH_COST_THRESHOLD)
            {
                out.push(format!(
                    "step '{}' moves {} {} in one call; consider splitting or gating it",
                    step.name,
                    value,
                    key
                ));
            }
            if SENSITIVE_PARAM_RE.is_match(key) {
                out.push(format!(
                    "step '{}' passes sensitive parameter '{key}' inline; use a secret reference",
                    step.name
                ));
            }
        }
    }

    out
}
