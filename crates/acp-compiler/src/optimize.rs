// SPDX-License-Identifier: MIT OR Apache-2.0
//! Plan optimization: deterministic topological ordering, parallel batch
//! grouping, risk classification, and resource estimation.
//!
//! Everything here must be a pure function of the definition: the optimizer
//! runs inside the plan-hash boundary, so any nondeterminism would break
//! plan-hash stability.

use acp_core::capsule::{CapsuleDefinition, StepDefinition};
use acp_core::plan::{PlanStep, ResourceEnvelope, RiskLevel};
use std::collections::{BTreeMap, BTreeSet};

/// Default per-step timeout when the definition does not set one.
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default retry attempts when the definition does not set them.
const DEFAULT_MAX_RETRIES: u32 = 2;

/// Base duration estimate per step.
const BASE_DURATION_MS: u64 = 800;

/// Additional duration estimate per parameter.
const PER_PARAM_DURATION_MS: u64 = 150;

/// Parameter names that mark a step as monetary.
const MONETARY_PARAMS: &[&str] = &["amount", "amount_cents", "price", "payment", "charge"];

/// Compile the definition's steps into ordered [`PlanStep`]s and parallel
/// batches.
///
/// The order is a deterministic topological sort (Kahn's algorithm with
/// lexicographic tie-breaking); batch `i` contains exactly the steps whose
/// dependencies all live in batches `< i`. Assumes the definition has already
/// passed validation (unique names, no cycles, known dependencies).
#[must_use]
pub fn compile_steps(definition: &CapsuleDefinition) -> (Vec<PlanStep>, Vec<Vec<String>>) {
    let by_name: BTreeMap<&str, &StepDefinition> = definition
        .steps
        .iter()
        .map(|s| (s.name.as_str(), s))
        .collect();

    // Kahn levels with BTreeSet frontier: deterministic order.
    let mut remaining_deps: BTreeMap<&str, BTreeSet<&str>> = definition
        .steps
        .iter()
        .map(|s| {
            (
                s.name.as_str(),
                s.depends_on.iter().map(String::as_str).collect(),
            )
        })
        .collect();

    let mut batches: Vec<Vec<String>> = Vec::new();
    let mut ordered: Vec<PlanStep> = Vec::new();

    while !remaining_deps.is_empty() {
        let ready: Vec<&str> = remaining_deps
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| *name)
            .collect();

        // Validation guarantees acyclicity, so every round frees a step.
        if ready.is_empty() {
            break;
        }

        for name in &ready {
            remaining_deps.remove(name);
        }
        for deps in remaining_deps.values_mut() {
            for name in &ready {
                deps.remove(name);
            }
        }

        for name in &ready {
            if let Some(step) = by_name.get(name) {
                ordered.push(lower_step(step));
            }
        }
        batches.push(ready.iter().map(|s| (*s).to_string()).collect());
    }

    (ordered, batches)
}

fn lower_step(step: &StepDefinition) -> PlanStep {
    let risk = classify_risk(step);
    PlanStep {
        name: step.name.clone(),
        tool: step.tool.clone(),
        parameters: step.parameters.clone(),
        depends_on: step.depends_on.clone(),
        timeout_ms: step.timeout_secs.map_or(DEFAULT_TIMEOUT_MS, |s| s * 1_000),
        max_retries: step.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        requires_approval: step.requires_approval,
        idempotent: step.idempotent,
        risk,
        resources: estimate_resources(step, risk),
    }
}

/// Classify a step's risk from its tool name and parameters.
#[must_use]
pub fn classify_risk(step: &StepDefinition) -> RiskLevel {
    let tool = step.tool.to_ascii_lowercase();
    let monetary = step
        .parameters
        .keys()
        .any(|k| MONETARY_PARAMS.contains(&k.to_ascii_lowercase().as_str()));

    if monetary || tool.contains("payment") || tool.contains("charge") || tool.contains("transfer")
    {
        return RiskLevel::Critical;
    }
    if tool.contains("delete") || tool.contains("drop") || tool.contains("destroy") {
        return RiskLevel::High;
    }
    if tool.starts_with("get")
        || tool.starts_with("list")
        || tool.starts_with("read")
        || tool.starts_with("http_get")
        || tool.contains("query")
    {
        return RiskLevel::Low;
    }
    RiskLevel::Medium
}

fn estimate_resources(step: &StepDefinition, risk: RiskLevel) -> ResourceEnvelope {
    let est_duration_ms = BASE_DURATION_MS + PER_PARAM_DURATION_MS * step.parameters.len() as u64;

    // Monetary parameters contribute their face value to the cost estimate.
    let monetary_total: u64 = step
        .parameters
        .iter()
        .filter(|(k, _)| MONETARY_PARAMS.contains(&k.to_ascii_lowercase().as_str()))
        .filter_map(|(_, v)| v.as_u64())
        .sum();
    let base_cost = match risk {
        RiskLevel::Low => 0,
        RiskLevel::Medium => 1_000,
        RiskLevel::High => 5_000,
        RiskLevel::Critical => 25_000,
    };

    ResourceEnvelope {
        est_duration_ms,
        est_cost_micros: base_cost + monetary_total * 1_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn step(name: &str, depends_on: &[&str]) -> StepDefinition {
        StepDefinition {
            name: name.into(),
            tool: "demo_tool".into(),
            parameters: BTreeMap::new(),
            depends_on: depends_on.iter().map(|s| (*s).to_string()).collect(),
            timeout_secs: None,
            max_retries: None,
            requires_approval: false,
            idempotent: true,
        }
    }

    fn definition(steps: Vec<StepDefinition>) -> CapsuleDefinition {
        CapsuleDefinition {
            name: "opt-test".into(),
            version: "1.0.0".into(),
            description: None,
            dependencies: vec![],
            steps,
            security: acp_core::capsule::SecurityContext::default(),
        }
    }

    #[test]
    fn diamond_graph_batches() {
        let def = definition(vec![
            step("d", &["b", "c"]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("a", &[]),
        ]);
        let (ordered, batches) = compile_steps(&def);
        assert_eq!(
            batches,
            vec![
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["d".to_string()],
            ]
        );
        assert_eq!(
            ordered.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c", "d"]
        );
    }

    #[test]
    fn independent_steps_share_one_batch() {
        let def = definition(vec![step("z", &[]), step("a", &[]), step("m", &[])]);
        let (_, batches) = compile_steps(&def);
        assert_eq!(batches.len(), 1);
        // Lexicographic within the batch: declaration order must not matter.
        assert_eq!(batches[0], vec!["a", "m", "z"]);
    }

    #[test]
    fn ordering_is_deterministic_across_calls() {
        let def = definition(vec![
            step("c", &[]),
            step("a", &[]),
            step("b", &["a", "c"]),
        ]);
        let (first, _) = compile_steps(&def);
        let (second, _) = compile_steps(&def);
        let names = |steps: &[PlanStep]| {
            steps.iter().map(|s| s.name.clone()).collect::<Vec<_>>()
        };
        assert_eq!(names(&first), names(&second));
    }

    #[test]
    fn defaults_applied() {
        let def = definition(vec![step("a", &[])]);
        let (ordered, _) = compile_steps(&def);
        assert_eq!(ordered[0].timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(ordered[0].max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn explicit_timeout_wins() {
        let mut s = step("a", &[]);
        s.timeout_secs = Some(5);
        let (ordered, _) = compile_steps(&definition(vec![s]));
        assert_eq!(ordered[0].timeout_ms, 5_000);
    }

    #[test]
    fn risk_classification_rules() {
        let mut payment = step("pay", &[]);
        payment.tool = "payment_create".into();
        assert_eq!(classify_risk(&payment), RiskLevel::Critical);

        let mut monetary = step("charge", &[]);
        monetary.parameters.insert("amount".into(), json!(100));
        assert_eq!(classify_risk(&monetary), RiskLevel::Critical);

        let mut delete = step("rm", &[]);
        delete.tool = "delete_records".into();
        assert_eq!(classify_risk(&delete), RiskLevel::High);

        let mut read = step("q", &[]);
        read.tool = "http_get".into();
        assert_eq!(classify_risk(&read), RiskLevel::Low);

        assert_eq!(classify_risk(&step("other", &[])), RiskLevel::Medium);
    }

    #[test]
    fn monetary_parameters_inflate_cost() {
        let mut s = step("pay", &[]);
        s.parameters.insert("amount".into(), json!(250));
        let (ordered, _) = compile_steps(&definition(vec![s]));
        assert!(ordered[0].resources.est_cost_micros >= 250_000);
    }

    #[test]
    fn duration_scales_with_parameters() {
        let mut s = step("a", &[]);
        s.parameters.insert("x".into(), json!(1));
        s.parameters.insert("y".into(), json!(2));
        let (ordered, _) = compile_steps(&definition(vec![s]));
        assert_eq!(
            ordered[0].resources.est_duration_ms,
            BASE_DURATION_MS + 2 * PER_PARAM_DURATION_MS
        );
    }
}
