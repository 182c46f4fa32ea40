// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only audit trail for token operations.
//!
//! Records carry the jti, never the token string itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// The operation an audit record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    /// A token was issued.
    Issued,
    /// A token passed verification.
    Verified,
    /// A verification attempt failed.
    Failed,
    /// A token was revoked.
    Revoked,
    /// A token was refreshed into a successor.
    Refreshed,
}

/// One immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// What happened.
    pub event: AuditKind,
    /// Token id the event concerns.
    pub jti: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// When the event occurred.
    pub at: DateTime<Utc>,
    /// Caller-supplied attributes (client address, user agent, reason).
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

/// In-process append-only audit log with tenant-scoped reads.
#[derive(Debug, Default)]
pub struct AuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl AuditLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn record(
        &self,
        event: AuditKind,
        jti: impl Into<String>,
        tenant_id: impl Into<String>,
        attrs: BTreeMap<String, String>,
    ) {
        let record = AuditRecord {
            event,
            jti: jti.into(),
            tenant_id: tenant_id.into(),
            at: Utc::now(),
            attrs,
        };
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }

    /// All records for `tenant_id`, oldest first.
    #[must_use]
    pub fn for_tenant(&self, tenant_id: &str) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.tenant_id == tenant_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Records for `tenant_id` filtered by event kind.
    #[must_use]
    pub fn for_tenant_kind(&self, tenant_id: &str, kind: AuditKind) -> Vec<AuditRecord> {
        self.for_tenant(tenant_id)
            .into_iter()
            .filter(|r| r.event == kind)
            .collect()
    }

    /// Total number of records across tenants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Returns `true` if no records have been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
