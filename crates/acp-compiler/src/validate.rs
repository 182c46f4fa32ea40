// SPDX-License-Identifier: MIT OR Apache-2.0
//! Capsule validation: YAML syntax, structural schema, business rules.
//!
//! Validation is staged. A YAML parse failure short-circuits; structural and
//! business rules accumulate so the caller sees every problem at once.

use acp_core::capsule::CapsuleDefinition;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

use crate::CompileError;

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9]*(-[a-z0-9]+)*$").expect("static name pattern must compile")
});

static SEMVER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(-[0-9A-Za-z.-]+)?$")
        .expect("static semver pattern must compile")
});

/// Parse a capsule definition from YAML source.
///
/// # Errors
///
/// Returns [`CompileError::Yaml`] when the source is not valid YAML or does
/// not match the definition structure.
pub fn parse_yaml(source: &str) -> Result<CapsuleDefinition, CompileError> {
    serde_yaml::from_str(source).map_err(|e| CompileError::Yaml(e.to_string()))
}

/// Returns `true` if `name` is a valid lowercase-hyphen identifier.
#[must_use]
pub fn valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

/// Returns `true` if `version` is a valid semantic version.
#[must_use]
pub fn valid_semver(version: &str) -> bool {
    SEMVER_RE.is_match(version)
}

/// Returns `true` if `reference` is a valid `name@version` dependency ref.
#[must_use]
pub fn valid_dependency_ref(reference: &str) -> bool {
    match reference.split_once('@') {
        Some((name, version)) => valid_name(name) && valid_semver(version),
        None => false,
    }
}

/// Apply every business rule to a parsed definition.
///
/// # Errors
///
/// Returns [`CompileError::Validation`] carrying one message per violated
/// rule.
pub fn validate(definition: &CapsuleDefinition) -> Result<(), CompileError> {
    let mut problems = Vec::new();

    if !valid_name(&definition.name) {
        problems.push(format!(
            "capsule name '{}' must be lowercase-hyphen",
            definition.name
        ));
    }
    if !valid_semver(&definition.version) {
        problems.push(format!(
            "capsule version '{}' is not a semantic version",
            definition.version
        ));
    }

    for dep in &definition.dependencies {
        if !valid_dependency_ref(dep) {
            problems.push(format!("dependency '{dep}' must be 'name@version'"));
        }
    }

    if definition.steps.is_empty() {
        problems.push("capsule must define at least one step".to_string());
    }

    let mut seen = BTreeSet::new();
    for step in &definition.steps {
        if !seen.insert(step.name.as_str()) {
            problems.push(format!("duplicate step name '{}'", step.name));
        }
        if step.tool.trim().is_empty() {
            problems.push(format!("step '{}' has an empty tool reference", step.name));
        }
        if definition.security.denied_tools.contains(&step.tool) {
            problems.push(format!(
                "step '{}' invokes denied tool '{}'",
                step.name, step.tool
            ));
        }
        if !definition.security.allowed_tools.is_empty()
            && !definition.security.allowed_tools.contains(&step.tool)
        {
            problems.push(format!(
                "step '{}' invokes tool '{}' outside the allowed set",
                step.name, step.tool
            ));
        }
    }

    for step in &definition.steps {
        for dep in &step.depends_on {
            if !definition.steps.iter().any(|s| &s.name == dep) {
                problems.push(format!(
                    "step '{}' depends on unknown step '{dep}'",
                    step.name
                ));
            }
        }
    }

    if let Some(cycle) = find_step_cycle(definition) {
        problems.push(format!("step dependencies form a cycle through '{cycle}'"));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(CompileError::Validation(problems))
    }
}

/// Detect a cycle in the intra-capsule step graph; returns a step on the
/// cycle if one exists.
fn find_step_cycle(definition: &CapsuleDefinition) -> Option<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }

    fn visit(
        name: &str,
        definition: &CapsuleDefinition,
        marks: &mut std::collections::BTreeMap<String, Mark>,
    ) -> Option<String> {
        match marks.get(name) {
            Some(Mark::Black) => return None,
            Some(Mark::Grey) => return Some(name.to_string()),
            _ => {}
        }
        marks.insert(name.to_string(), Mark::Grey);
        if let Some(step) = definition.steps.iter().find(|s| s.name == name) {
            for dep in &step.depends_on {
                if let Some(hit) = visit(dep, definition, marks) {
                    return Some(hit);
                }
            }
        }
        marks.insert(name.to_string(), Mark::Black);
        None
    }

    let mut marks = std::collections::BTreeMap::new();
    for step in &definition.steps {
        if let Some(hit) = visit(&step.name, definition, &mut marks) {
            return Some(hit);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use acp_core::capsule::{SecurityContext, StepDefinition};
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
            name: "report-sync".into(),
            version: "1.0.0".into(),
            description: None,
            dependencies: vec![],
            steps,
            security: SecurityContext::default(),
        }
    }

    // -- name / version / ref formats ------------------------------------

    #[test]
    fn names() {
        assert!(valid_name("invoice-sync"));
        assert!(valid_name("a"));
        assert!(valid_name("a2-b3"));
        assert!(!valid_name("Invoice"));
        assert!(!valid_name("-leading"));
        assert!(!valid_name("trailing-"));
        assert!(!valid_name("double--hyphen"));
        assert!(!valid_name("under_score"));
        assert!(!valid_name(""));
    }

    #[test]
    fn semvers() {
        assert!(valid_semver("0.1.0"));
        assert!(valid_semver("10.20.30"));
        assert!(valid_semver("1.0.0-rc.1"));
        assert!(!valid_semver("1.0"));
        assert!(!valid_semver("01.0.0"));
        assert!(!valid_semver("1.0.0.0"));
        assert!(!valid_semver("v1.0.0"));
    }

    #[test]
    fn dependency_refs() {
        assert!(valid_dependency_ref("ledger-export@2.0.1"));
        assert!(!valid_dependency_ref("ledger-export"));
        assert!(!valid_dependency_ref("@1.0.0"));
        assert!(!valid_dependency_ref("Ledger@1.0.0"));
        assert!(!valid_dependency_ref("ledger@latest"));
    }

    // -- YAML parsing -----------------------------------------------------

    #[test]
    fn parses_minimal_yaml() {
        let def = parse_yaml(
            r"
name: invoice-sync
version: 1.0.0
steps:
  - name: fetch
    tool: http_get
",
        )
        .unwrap();
        assert_eq!(def.name, "invoice-sync");
        assert_eq!(def.steps.len(), 1);
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(matches!(
            parse_yaml("name: [unclosed"),
            Err(CompileError::Yaml(_))
        ));
    }

    #[test]
    fn rejects_structurally_wrong_yaml() {
        assert!(matches!(
            parse_yaml("just_a: scalar"),
            Err(CompileError::Yaml(_))
        ));
    }

    // -- business rules ---------------------------------------------------

    #[test]
    fn accepts_valid_definition() {
        let def = definition(vec![step("a", &[]), step("b", &["a"])]);
        assert!(validate(&def).is_ok());
    }

    #[test]
    fn rejects_bad_name_and_version_together() {
        let mut def = definition(vec![step("a", &[])]);
        def.name = "Bad Name".into();
        def.version = "one".into();
        let Err(CompileError::Validation(problems)) = validate(&def) else {
            panic!("expected validation failure");
        };
        assert_eq!(problems.len(), 2);
    }

    #[test]
    fn rejects_duplicate_step_names() {
        let def = definition(vec![step("a", &[]), step("a", &[])]);
        let Err(CompileError::Validation(problems)) = validate(&def) else {
            panic!("expected validation failure");
        };
        assert!(problems.iter().any(|p| p.contains("duplicate step name")));
    }

    #[test]
    fn rejects_unknown_step_dependency() {
        let def = definition(vec![step("a", &["ghost"])]);
        let Err(CompileError::Validation(problems)) = validate(&def) else {
            panic!("expected validation failure");
        };
        assert!(problems.iter().any(|p| p.contains("unknown step 'ghost'")));
    }

    #[test]
    fn rejects_step_cycle() {
        let def = definition(vec![step("a", &["b"]), step("b", &["a"])]);
        let Err(CompileError::Validation(problems)) = validate(&def) else {
            panic!("expected validation failure");
        };
        assert!(problems.iter().any(|p| p.contains("cycle")));
    }

    #[test]
    fn rejects_self_dependency() {
        let def = definition(vec![step("a", &["a"])]);
        assert!(validate(&def).is_err());
    }

    #[test]
    fn rejects_empty_steps() {
        let def = definition(vec![]);
        let Err(CompileError::Validation(problems)) = validate(&def) else {
            panic!("expected validation failure");
        };
        assert!(problems.iter().any(|p| p.contains("at least one step")));
    }

    #[test]
    fn rejects_denied_tool() {
        let mut def = definition(vec![step("a", &[])]);
        def.security.denied_tools = vec!["demo_tool".into()];
        let Err(CompileError::Validation(problems)) = validate(&def) else {
            panic!("expected validation failure");
        };
        assert!(problems.iter().any(|p| p.contains("denied tool")));
    }

    #[test]
    fn rejects_bad_dependency_ref() {
        let mut def = definition(vec![step("a", &[])]);
        def.dependencies = vec!["not-a-ref".into()];
        assert!(validate(&def).is_err());
    }
}
