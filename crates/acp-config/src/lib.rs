// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the control plane.
//!
//! One immutable [`ControlPlaneConfig`] is built at startup from an optional
//! TOML file plus `ACP_*` environment overrides. There is no runtime
//! mutation: components receive the values they need at construction.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Hard ceiling on capability-token TTL, in seconds.
pub const TOKEN_TTL_CEILING_SECS: u64 = 300;

/// Floor on idempotency record retention, in hours.
pub const IDEMPOTENCY_TTL_FLOOR_HOURS: u64 = 24;

// ---------------------------------------------------------------------------
// Errors & warnings
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory-level issues that do not prevent operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// An approval deadline long enough to stall runs for hours.
    LargeApprovalDeadline {
        /// Configured deadline in seconds.
        secs: u64,
    },
    /// The signing key reference points at an ephemeral key.
    EphemeralSigningKey,
    /// Retry ceiling low enough to give up on first transient failure.
    NoRetries,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::LargeApprovalDeadline { secs } => {
                write!(f, "approval.default_deadline_seconds = {secs} will stall runs")
            }
            ConfigWarning::EphemeralSigningKey => {
                write!(f, "crypto.signing_key_ref is ephemeral; receipts will not verify across restarts")
            }
            ConfigWarning::NoRetries => write!(f, "retry.max_attempts <= 1 disables retries"),
        }
    }
}

// ---------------------------------------------------------------------------
// Config sections
// ---------------------------------------------------------------------------

/// Capability-token issuance limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TokenConfig {
    /// Maximum TTL a caller may request (≤ 300).
    pub max_ttl_seconds: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            max_ttl_seconds: TOKEN_TTL_CEILING_SECS,
        }
    }
}

/// Approval workflow defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Deadline applied when a clarification does not set one.
    pub default_deadline_seconds: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_deadline_seconds: 3_600,
        }
    }
}

/// Retry/backoff policy for tool invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts including the first.
    pub max_attempts: u32,
    /// First backoff delay in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub max_delay_ms: u64,
    /// Random jitter as a fraction of the delay (0.0–1.0).
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter_ratio: 0.2,
        }
    }
}

/// Orchestrator concurrency bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrent non-terminal runs allowed per tenant.
    pub max_concurrent_runs_per_tenant: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs_per_tenant: 8,
        }
    }
}

/// Event stream retention and redelivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EventBusConfig {
    /// Events older than this many days are pruned.
    pub stream_retention_days: u32,
    /// Redeliveries beyond this count dead-letter the event.
    pub max_deliver: u32,
    /// Dead-letter subject.
    pub dlq_subject: String,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            stream_retention_days: 7,
            max_deliver: 5,
            dlq_subject: "events.dlq".into(),
        }
    }
}

/// Idempotency record retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Record TTL in hours (≥ 24).
    pub record_ttl_hours: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            record_ttl_hours: IDEMPOTENCY_TTL_FLOOR_HOURS,
        }
    }
}

/// Crypto material references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CryptoConfig {
    /// Opaque signing-key reference, resolved through the secrets
    /// collaborator: `env:<VAR>`, `file:<path>`, or `ephemeral`.
    pub signing_key_ref: String,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            signing_key_ref: "ephemeral".into(),
        }
    }
}

/// HTTP server binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the gateway.
    pub bind: String,
    /// Root directory for durable state (replay guard, receipts, WORM).
    pub data_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".into(),
            data_dir: ".autoplane".into(),
        }
    }
}

/// Top-level runtime configuration for the control plane.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Capability-token limits.
    pub token: TokenConfig,
    /// Approval defaults.
    pub approval: ApprovalConfig,
    /// Retry policy.
    pub retry: RetryConfig,
    /// Orchestrator bounds.
    pub orchestrator: OrchestratorConfig,
    /// Event-bus retention.
    pub event_bus: EventBusConfig,
    /// Idempotency retention.
    pub idempotency: IdempotencyConfig,
    /// Crypto references.
    pub crypto: CryptoConfig,
    /// Server binding and data directory.
    pub server: ServerConfig,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`ControlPlaneConfig`] from an optional TOML file path.
///
/// Environment overrides apply on top in both cases; the result is validated
/// before it is returned.
///
/// # Errors
///
/// See [`ConfigError`].
pub fn load_config(path: Option<&Path>) -> Result<ControlPlaneConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => ControlPlaneConfig::default(),
    };
    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

/// Parse a TOML string into a [`ControlPlaneConfig`].
///
/// # Errors
///
/// Returns [`ConfigError::ParseError`] on malformed TOML.
pub fn parse_toml(content: &str) -> Result<ControlPlaneConfig, ConfigError> {
    toml::from_str::<ControlPlaneConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

/// Apply environment variable overrides.
///
/// Recognised variables: `ACP_BIND`, `ACP_DATA_DIR`, `ACP_SIGNING_KEY_REF`,
/// `ACP_MAX_RUNS_PER_TENANT`.
pub fn apply_env_overrides(config: &mut ControlPlaneConfig) {
    if let Ok(val) = std::env::var("ACP_BIND") {
        config.server.bind = val;
    }
    if let Ok(val) = std::env::var("ACP_DATA_DIR") {
        config.server.data_dir = val;
    }
    if let Ok(val) = std::env::var("ACP_SIGNING_KEY_REF") {
        config.crypto.signing_key_ref = val;
    }
    if let Ok(val) = std::env::var("ACP_MAX_RUNS_PER_TENANT") {
        if let Ok(parsed) = val.parse() {
            config.orchestrator.max_concurrent_runs_per_tenant = parsed;
        }
    }
}

/// Validate hard constraints.
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] listing every violated
/// constraint.
pub fn validate(config: &ControlPlaneConfig) -> Result<(), ConfigError> {
    let mut reasons = Vec::new();

    if config.token.max_ttl_seconds == 0 || config.token.max_ttl_seconds > TOKEN_TTL_CEILING_SECS {
        reasons.push(format!(
            "token.max_ttl_seconds must be in (0, {TOKEN_TTL_CEILING_SECS}]"
        ));
    }
    if config.idempotency.record_ttl_hours < IDEMPOTENCY_TTL_FLOOR_HOURS {
        reasons.push(format!(
            "idempotency.record_ttl_hours must be >= {IDEMPOTENCY_TTL_FLOOR_HOURS}"
        ));
    }
    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        reasons.push("retry.base_delay_ms must be <= retry.max_delay_ms".into());
    }
    if !(0.0..=1.0).contains(&config.retry.jitter_ratio) {
        reasons.push("retry.jitter_ratio must be within [0, 1]".into());
    }
    if config.retry.max_attempts == 0 {
        reasons.push("retry.max_attempts must be >= 1".into());
    }
    if config.orchestrator.max_concurrent_runs_per_tenant == 0 {
        reasons.push("orchestrator.max_concurrent_runs_per_tenant must be >= 1".into());
    }
    if config.event_bus.max_deliver == 0 {
        reasons.push("event_bus.max_deliver must be >= 1".into());
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError { reasons })
    }
}

/// Collect advisory warnings for a valid configuration.
#[must_use]
pub fn warnings(config: &ControlPlaneConfig) -> Vec<ConfigWarning> {
    let mut out = Vec::new();
    if config.approval.default_deadline_seconds > 86_400 {
        out.push(ConfigWarning::LargeApprovalDeadline {
            secs: config.approval.default_deadline_seconds,
        });
    }
    if config.crypto.signing_key_ref == "ephemeral" {
        out.push(ConfigWarning::EphemeralSigningKey);
    }
    if config.retry.max_attempts <= 1 {
        out.push(ConfigWarning::NoRetries);
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ControlPlaneConfig::default();
        assert!(validate(&config).is_ok());
        assert_eq!(config.token.max_ttl_seconds, 300);
        assert_eq!(config.idempotency.record_ttl_hours, 24);
    }

    #[test]
    fn parses_partial_toml() {
        let config = parse_toml(
            r#"
[token]
max_ttl_seconds = 120

[retry]
max_attempts = 5
"#,
        )
        .unwrap();
        assert_eq!(config.token.max_ttl_seconds, 120);
        assert_eq!(config.retry.max_attempts, 5);
        // Untouched sections keep defaults.
        assert_eq!(config.orchestrator.max_concurrent_runs_per_tenant, 8);
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(matches!(
            parse_toml("[token\nmax"),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn ttl_ceiling_enforced() {
        let mut config = ControlPlaneConfig::default();
        config.token.max_ttl_seconds = 301;
        let Err(ConfigError::ValidationError { reasons }) = validate(&config) else {
            panic!("expected validation failure");
        };
        assert!(reasons[0].contains("max_ttl_seconds"));
    }

    #[test]
    fn idempotency_floor_enforced() {
        let mut config = ControlPlaneConfig::default();
        config.idempotency.record_ttl_hours = 12;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn retry_bounds_enforced() {
        let mut config = ControlPlaneConfig::default();
        config.retry.base_delay_ms = 10_000;
        config.retry.max_delay_ms = 1_000;
        config.retry.jitter_ratio = 1.5;
        let Err(ConfigError::ValidationError { reasons }) = validate(&config) else {
            panic!("expected validation failure");
        };
        assert_eq!(reasons.len(), 2);
    }

    #[test]
    fn load_from_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acp.toml");
        std::fs::write(&path, "[server]\nbind = \"0.0.0.0:9999\"\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9999");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(matches!(
            load_config(Some(Path::new("/nonexistent/acp.toml"))),
            Err(ConfigError::FileNotFound { .. })
        ));
    }

    #[test]
    fn warnings_flag_soft_issues() {
        let mut config = ControlPlaneConfig::default();
        config.approval.default_deadline_seconds = 172_800;
        config.retry.max_attempts = 1;
        let w = warnings(&config);
        assert!(w.contains(&ConfigWarning::LargeApprovalDeadline { secs: 172_800 }));
        assert!(w.contains(&ConfigWarning::EphemeralSigningKey));
        assert!(w.contains(&ConfigWarning::NoRetries));
    }

    #[test]
    fn clean_config_has_no_warnings() {
        let mut config = ControlPlaneConfig::default();
        config.crypto.signing_key_ref = "env:ACP_SIGNING_KEY".into();
        assert!(warnings(&config).is_empty());
    }

    #[test]
    fn config_serde_roundtrip() {
        let config = ControlPlaneConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let back = parse_toml(&toml_str).unwrap();
        assert_eq!(back, config);
    }
}
