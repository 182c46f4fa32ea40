// SPDX-License-Identifier: MIT OR Apache-2.0
//! Capsule artifacts.
//!
//! A capsule is the declarative automation unit a tenant submits: a named,
//! versioned definition of steps, tool references, and a security context.
//! Capsules are immutable per `(tenant, name, version)`; the checksum is the
//! SHA-256 of the canonical definition.

use acp_crypto::CryptoError;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A declarative automation artifact authored by a tenant.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Capsule {
    /// Registry-assigned identifier.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// Lowercase-hyphen capsule name.
    pub name: String,
    /// Semantic version of this capsule revision.
    pub version: String,
    /// The structured definition.
    pub definition: CapsuleDefinition,
    /// SHA-256 of the canonical definition.
    pub checksum: String,
    /// Optional detached signature over the checksum (publisher attestation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// When the capsule was registered.
    pub created_at: DateTime<Utc>,
}

impl Capsule {
    /// Assemble a capsule from a definition, computing its checksum.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] if the definition cannot be canonicalized.
    pub fn from_definition(
        tenant_id: impl Into<String>,
        definition: CapsuleDefinition,
    ) -> Result<Self, CryptoError> {
        let checksum = acp_crypto::content_hash(&definition)?;
        Ok(Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            name: definition.name.clone(),
            version: definition.version.clone(),
            definition,
            checksum,
            signature: None,
            created_at: Utc::now(),
        })
    }

    /// The `name@version` reference string for this capsule.
    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// Recompute the checksum and compare it against the stored value.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] if the definition cannot be canonicalized.
    pub fn checksum_valid(&self) -> Result<bool, CryptoError> {
        Ok(acp_crypto::content_hash(&self.definition)? == self.checksum)
    }
}

/// The structured body of a capsule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CapsuleDefinition {
    /// Capsule name (lowercase-hyphen).
    pub name: String,
    /// Semantic version.
    pub version: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Capsule dependencies as `name@version` references.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// The automation steps.
    pub steps: Vec<StepDefinition>,
    /// Security context constraining execution.
    #[serde(default)]
    pub security: SecurityContext,
}

/// One step of a capsule's automation flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepDefinition {
    /// Step name, unique within the capsule.
    pub name: String,
    /// Name of the tool this step invokes.
    pub tool: String,
    /// Tool parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Names of steps that must complete before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Per-step timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Maximum retry attempts for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Whether this step requires a human approval gate before running.
    #[serde(default)]
    pub requires_approval: bool,
    /// Whether the step's tool call is safe to retry.
    #[serde(default = "default_idempotent")]
    pub idempotent: bool,
}

fn default_idempotent() -> bool {
    true
}

/// Security context compiled into every plan derived from the capsule.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct SecurityContext {
    /// Tools the plan is allowed to invoke. Empty means "all referenced tools".
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Tools the plan must never invoke.
    #[serde(default)]
    pub denied_tools: Vec<String>,
    /// Capabilities the execution token must carry.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Hard cap on total execution time in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition() -> CapsuleDefinition {
        CapsuleDefinition {
            name: "invoice-sync".into(),
            version: "1.2.0".into(),
            description: Some("sync invoices nightly".into()),
            dependencies: vec!["ledger-export@2.0.1".into()],
            steps: vec![StepDefinition {
                name: "fetch".into(),
                tool: "http_get".into(),
                parameters: [("url".to_string(), json!("https://example.com"))]
                    .into_iter()
                    .collect(),
                depends_on: vec![],
                timeout_secs: Some(30),
                max_retries: Some(2),
                requires_approval: false,
                idempotent: true,
            }],
            security: SecurityContext::default(),
        }
    }

    #[test]
    fn checksum_is_canonical_definition_hash() {
        let def = definition();
        let capsule = Capsule::from_definition("T1", def.clone()).unwrap();
        assert_eq!(capsule.checksum, acp_crypto::content_hash(&def).unwrap());
        assert!(capsule.checksum_valid().unwrap());
    }

    #[test]
    fn checksum_detects_definition_mutation() {
        let mut capsule = Capsule::from_definition("T1", definition()).unwrap();
        capsule.definition.version = "9.9.9".into();
        assert!(!capsule.checksum_valid().unwrap());
    }

    #[test]
    fn reference_format() {
        let capsule = Capsule::from_definition("T1", definition()).unwrap();
        assert_eq!(capsule.reference(), "invoice-sync@1.2.0");
    }

    #[test]
    fn definition_serde_roundtrip() {
        let def = definition();
        let json = serde_json::to_value(&def).unwrap();
        let back: CapsuleDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(back, def);
    }

    #[test]
    fn step_idempotent_defaults_true() {
        let step: StepDefinition = serde_json::from_value(json!({
            "name": "s1",
            "tool": "noop"
        }))
        .unwrap();
        assert!(step.idempotent);
        assert!(!step.requires_approval);
    }
}
