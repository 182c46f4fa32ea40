// SPDX-License-Identifier: MIT OR Apache-2.0
//! Transitive capsule dependency resolution.
//!
//! The registry itself is an external collaborator; this module only defines
//! the seam ([`CapsuleRegistry`]) and walks it. Resolution confirms that
//! every `name@version` reference exists for the tenant and that the
//! dependency graph is acyclic. Dependency steps are not inlined into the
//! consuming plan; a dependency is a deployment-ordering constraint, not a
//! macro expansion.

use acp_core::Capsule;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use crate::CompileError;

/// Read-side seam onto the capsule registry.
pub trait CapsuleRegistry: Send + Sync {
    /// Fetch a capsule by tenant, name, and exact version.
    fn get(&self, tenant_id: &str, name: &str, version: &str) -> Option<Capsule>;
}

/// In-memory registry used by tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    // (tenant, name, version) -> capsule
    capsules: RwLock<BTreeMap<(String, String, String), Capsule>>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a capsule. Existing `(tenant, name, version)` entries are
    /// immutable; re-inserting returns `false`.
    pub fn insert(&self, capsule: Capsule) -> bool {
        let key = (
            capsule.tenant_id.clone(),
            capsule.name.clone(),
            capsule.version.clone(),
        );
        let Ok(mut capsules) = self.capsules.write() else {
            return false;
        };
        if capsules.contains_key(&key) {
            return false;
        }
        capsules.insert(key, capsule);
        true
    }
}

impl MemoryRegistry {
    /// Look up a capsule by registry id, tenant-scoped.
    #[must_use]
    pub fn get_by_id(&self, tenant_id: &str, id: uuid::Uuid) -> Option<Capsule> {
        self.capsules
            .read()
            .ok()?
            .values()
            .find(|c| c.tenant_id == tenant_id && c.id == id)
            .cloned()
    }

    /// All capsules registered for a tenant, in `(name, version)` order.
    #[must_use]
    pub fn list(&self, tenant_id: &str) -> Vec<Capsule> {
        self.capsules
            .read()
            .map(|capsules| {
                capsules
                    .values()
                    .filter(|c| c.tenant_id == tenant_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl CapsuleRegistry for MemoryRegistry {
    fn get(&self, tenant_id: &str, name: &str, version: &str) -> Option<Capsule> {
        self.capsules
            .read()
            .ok()?
            .get(&(tenant_id.to_string(), name.to_string(), version.to_string()))
            .cloned()
    }
}

/// Resolve the transitive dependency closure of `capsule`.
///
/// Returns the references visited, in discovery order (excluding the root).
///
/// # Errors
///
/// - [`CompileError::DependencyNotFound`] when a reference has no capsule.
/// - [`CompileError::CycleDetected`] when capsules depend on each other.
pub fn resolve_dependencies(
    registry: &dyn CapsuleRegistry,
    capsule: &Capsule,
) -> Result<Vec<String>, CompileError> {
    let mut resolved = Vec::new();
    let mut done: BTreeSet<String> = BTreeSet::new();
    let mut in_progress: BTreeSet<String> = BTreeSet::new();

    walk(registry, capsule, &mut resolved, &mut done, &mut in_progress)?;
    Ok(resolved)
}

fn walk(
    registry: &dyn CapsuleRegistry,
    capsule: &Capsule,
    resolved: &mut Vec<String>,
    done: &mut BTreeSet<String>,
    in_progress: &mut BTreeSet<String>,
) -> Result<(), CompileError> {
    let self_ref = capsule.reference();
    in_progress.insert(self_ref.clone());

    for reference in &capsule.definition.dependencies {
        if done.contains(reference) {
            continue;
        }
        if in_progress.contains(reference) {
            return Err(CompileError::CycleDetected(reference.clone()));
        }

        let (name, version) = reference
            .split_once('@')
            .ok_or_else(|| CompileError::DependencyNotFound(reference.clone()))?;
        let dep = registry
            .get(&capsule.tenant_id, name, version)
            .ok_or_else(|| CompileError::DependencyNotFound(reference.clone()))?;

        walk(registry, &dep, resolved, done, in_progress)?;
        resolved.push(reference.clone());
        done.insert(reference.clone());
    }

    in_progress.remove(&self_ref);
    done.insert(self_ref);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use acp_core::capsule::{CapsuleDefinition, SecurityContext, StepDefinition};
    use std::collections::BTreeMap;

    fn capsule(tenant: &str, name: &str, version: &str, deps: &[&str]) -> Capsule {
        let definition = CapsuleDefinition {
            name: name.into(),
            version: version.into(),
            description: None,
            dependencies: deps.iter().map(|s| (*s).to_string()).collect(),
            steps: vec![StepDefinition {
                name: "noop".into(),
                tool: "noop".into(),
                parameters: BTreeMap::new(),
                depends_on: vec![],
                timeout_secs: None,
                max_retries: None,
                requires_approval: false,
                idempotent: true,
            }],
            security: SecurityContext::default(),
        };
        Capsule::from_definition(tenant, definition).unwrap()
    }

    #[test]
    fn resolves_linear_chain() {
        let registry = MemoryRegistry::new();
        registry.insert(capsule("T1", "base", "1.0.0", &[]));
        registry.insert(capsule("T1", "mid", "1.0.0", &["base@1.0.0"]));
        let root = capsule("T1", "top", "1.0.0", &["mid@1.0.0"]);

        let resolved = resolve_dependencies(&registry, &root).unwrap();
        assert_eq!(resolved, vec!["base@1.0.0", "mid@1.0.0"]);
    }

    #[test]
    fn shared_dependency_resolved_once() {
        let registry = MemoryRegistry::new();
        registry.insert(capsule("T1", "base", "1.0.0", &[]));
        registry.insert(capsule("T1", "left", "1.0.0", &["base@1.0.0"]));
        registry.insert(capsule("T1", "right", "1.0.0", &["base@1.0.0"]));
        let root = capsule("T1", "top", "1.0.0", &["left@1.0.0", "right@1.0.0"]);

        let resolved = resolve_dependencies(&registry, &root).unwrap();
        assert_eq!(
            resolved,
            vec!["base@1.0.0", "left@1.0.0", "right@1.0.0"]
        );
    }

    #[test]
    fn missing_dependency_fails() {
        let registry = MemoryRegistry::new();
        let root = capsule("T1", "top", "1.0.0", &["ghost@1.0.0"]);
        assert!(matches!(
            resolve_dependencies(&registry, &root),
            Err(CompileError::DependencyNotFound(r)) if r == "ghost@1.0.0"
        ));
    }

    #[test]
    fn version_must_match_exactly() {
        let registry = MemoryRegistry::new();
        registry.insert(capsule("T1", "base", "1.0.0", &[]));
        let root = capsule("T1", "top", "1.0.0", &["base@1.0.1"]);
        assert!(matches!(
            resolve_dependencies(&registry, &root),
            Err(CompileError::DependencyNotFound(_))
        ));
    }

    #[test]
    fn dependency_cycle_detected() {
        let registry = MemoryRegistry::new();
        registry.insert(capsule("T1", "a", "1.0.0", &["b@1.0.0"]));
        registry.insert(capsule("T1", "b", "1.0.0", &["a@1.0.0"]));
        let root = capsule("T1", "root", "1.0.0", &["a@1.0.0"]);
        assert!(matches!(
            resolve_dependencies(&registry, &root),
            Err(CompileError::CycleDetected(_))
        ));
    }

    #[test]
    fn registry_is_tenant_scoped() {
        let registry = MemoryRegistry::new();
        registry.insert(capsule("T2", "base", "1.0.0", &[]));
        let root = capsule("T1", "top", "1.0.0", &["base@1.0.0"]);
        // T2's capsule must be invisible to T1.
        assert!(matches!(
            resolve_dependencies(&registry, &root),
            Err(CompileError::DependencyNotFound(_))
        ));
    }

    #[test]
    fn registry_entries_are_immutable() {
        let registry = MemoryRegistry::new();
        assert!(registry.insert(capsule("T1", "base", "1.0.0", &[])));
        assert!(!registry.insert(capsule("T1", "base", "1.0.0", &[])));
    }

    #[test]
    fn id_lookup_is_tenant_scoped() {
        let registry = MemoryRegistry::new();
        let c = capsule("T1", "base", "1.0.0", &[]);
        let id = c.id;
        registry.insert(c);
        assert!(registry.get_by_id("T1", id).is_some());
        // Another tenant must not see the capsule, even by id.
        assert!(registry.get_by_id("T2", id).is_none());
        assert_eq!(registry.list("T1").len(), 1);
        assert!(registry.list("T2").is_empty());
    }
}
