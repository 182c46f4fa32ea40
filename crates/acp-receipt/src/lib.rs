// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tamper-evident execution receipts.
//!
//! A receipt commits to `{run_id, plan_hash, tenant, status, results digest,
//! timestamps, token jti}`: the content hash is the SHA-256 of the canonical
//! payload, the signature is Ed25519 over that hash, and each receipt links
//! to the tenant's previous receipt through `prior_receipt_hash`. The chain
//! head only advances under compare-and-set; contenders observe success or a
//! conflict, never silent retries.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Receipt persistence.
pub mod store;
/// Append-only WORM export sink.
pub mod worm;

pub use store::ReceiptStore;
pub use worm::WormSink;

use acp_core::run::RunStatus;
use acp_crypto::Keypair;
use acp_error::ErrorCode;
use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from receipt operations.
#[derive(Debug, Error)]
pub enum ReceiptError {
    /// No receipt exists with the requested id for the tenant.
    #[error("receipt not found")]
    NotFound,

    /// Canonicalization or signing failed.
    #[error("receipt crypto failure: {0}")]
    Crypto(String),

    /// The backing store failed.
    #[error("receipt storage failure: {0}")]
    Storage(String),

    /// The tenant's chain head moved between read and update.
    #[error("receipt chain head contention")]
    ChainContention,

    /// The receipt was already exported to the WORM sink.
    #[error("receipt already exported")]
    WormConflict,
}

impl ReceiptError {
    /// The stable error code for this failure.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound => ErrorCode::ReceiptNotFound,
            Self::ChainContention | Self::WormConflict => ErrorCode::ChainHeadContention,
            Self::Crypto(_) | Self::Storage(_) => ErrorCode::Internal,
        }
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The signed body of a receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptPayload {
    /// The execution this receipt records.
    pub run_id: Uuid,
    /// The exact plan hash that was executed: the preview/execute contract.
    pub plan_hash: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Terminal status of the run.
    pub status: RunStatus,
    /// SHA-256 over the canonical step results.
    pub results_digest: String,
    /// When the run was accepted.
    pub started_at: DateTime<Utc>,
    /// When the run reached its terminal state.
    pub completed_at: DateTime<Utc>,
    /// jti of the capability token the run executed under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_token_jti: Option<String>,
}

/// A signed, chained receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    /// Unique receipt id.
    pub receipt_id: Uuid,
    /// Owning tenant (duplicated from the payload for indexed reads).
    pub tenant_id: String,
    /// The committed payload.
    pub payload: ReceiptPayload,
    /// SHA-256 of the canonical payload.
    pub content_hash: String,
    /// URL-safe base64 Ed25519 signature over `content_hash`.
    pub signature: String,
    /// Content hash of the tenant's previous receipt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_receipt_hash: Option<String>,
    /// WORM export location, once exported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worm_uri: Option<String>,
    /// When the receipt was created.
    pub created_at: DateTime<Utc>,
}

/// Result of verifying a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    /// Whether every check passed.
    pub valid: bool,
    /// The first failed check, when invalid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Verification {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// Outcome of a whole-chain verification for one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainReport {
    /// Receipts checked.
    pub checked: usize,
    /// Receipt ids whose hash or signature failed.
    pub invalid: Vec<Uuid>,
    /// Receipt ids whose prior link does not match its predecessor.
    pub broken_links: Vec<Uuid>,
    /// `true` when every receipt verified and every link held.
    pub is_valid: bool,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Issues, verifies, and exports receipts.
pub struct ReceiptService {
    keypair: Keypair,
    store: Arc<ReceiptStore>,
    heads: Mutex<HashMap<String, String>>,
    worm: Option<WormSink>,
}

impl ReceiptService {
    /// Create a service over a signing key and store.
    ///
    /// Chain heads are rebuilt from the store, so issuance continues a
    /// tenant's chain across restarts.
    #[must_use]
    pub fn new(keypair: Keypair, store: Arc<ReceiptStore>) -> Self {
        // The newest receipt per tenant is the chain head; list_all is
        // oldest-first, so the last write per tenant wins.
        let mut heads = HashMap::new();
        for receipt in store.list_all() {
            heads.insert(receipt.tenant_id, receipt.content_hash);
        }

        Self {
            keypair,
            store,
            heads: Mutex::new(heads),
            worm: None,
        }
    }

    /// Attach a WORM sink; issued receipts can then be exported.
    #[must_use]
    pub fn with_worm(mut self, sink: WormSink) -> Self {
        self.worm = Some(sink);
        self
    }

    /// The public key receipts verify against.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.keypair.verifying_key()
    }

    /// Issue a receipt for `payload`, advancing the tenant's chain head.
    ///
    /// # Errors
    ///
    /// See [`ReceiptError`].
    pub fn issue(&self, payload: ReceiptPayload) -> Result<Receipt, ReceiptError> {
        let content_hash =
            acp_crypto::content_hash(&payload).map_err(|e| ReceiptError::Crypto(e.to_string()))?;
        let signature = acp_crypto::b64_encode(&self.keypair.sign(content_hash.as_bytes()));

        let prior = {
            let heads = self.heads.lock().map_err(|_| poisoned())?;
            heads.get(&payload.tenant_id).cloned()
        };

        let receipt = Receipt {
            receipt_id: Uuid::new_v4(),
            tenant_id: payload.tenant_id.clone(),
            payload,
            content_hash: content_hash.clone(),
            signature,
            prior_receipt_hash: prior.clone(),
            worm_uri: None,
            created_at: Utc::now(),
        };

        // Compare-and-set on the chain head: if another writer advanced the
        // head since we read it, surface the conflict instead of clobbering.
        {
            let mut heads = self.heads.lock().map_err(|_| poisoned())?;
            let current = heads.get(&receipt.tenant_id).cloned();
            if current != prior {
                return Err(ReceiptError::ChainContention);
            }
            heads.insert(receipt.tenant_id.clone(), content_hash);
        }

        self.store.save(&receipt)?;
        info!(
            target: "acp.receipt",
            receipt_id = %receipt.receipt_id,
            run_id = %receipt.payload.run_id,
            plan_hash = %receipt.payload.plan_hash,
            chained = receipt.prior_receipt_hash.is_some(),
            "receipt issued"
        );
        Ok(receipt)
    }

    /// Export a stored receipt to the WORM sink, recording the URI.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiptError::Storage`] when no sink is configured, plus
    /// sink failures.
    pub fn export_worm(&self, receipt: &mut Receipt) -> Result<String, ReceiptError> {
        let sink = self
            .worm
            .as_ref()
            .ok_or_else(|| ReceiptError::Storage("no worm sink configured".into()))?;
        let uri = sink.export(receipt)?;
        receipt.worm_uri = Some(uri.clone());
        Ok(uri)
    }

    /// Fetch a receipt by id for a tenant.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiptError::NotFound`] when absent (or owned by another
    /// tenant).
    pub fn get(&self, tenant_id: &str, receipt_id: Uuid) -> Result<Receipt, ReceiptError> {
        self.store
            .get(tenant_id, receipt_id)
            .ok_or(ReceiptError::NotFound)
    }

    /// Verify a receipt: recompute the canonical hash, check the signature,
    /// and compare WORM content when exported.
    #[must_use]
    pub fn verify(&self, receipt: &Receipt) -> Verification {
        verify_with_key(receipt, &self.keypair.verifying_key(), self.worm.as_ref())
    }

    /// Verify a stored receipt by id.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiptError::NotFound`] when the receipt does not exist.
    pub fn verify_by_id(
        &self,
        tenant_id: &str,
        receipt_id: Uuid,
    ) -> Result<Verification, ReceiptError> {
        let receipt = self.get(tenant_id, receipt_id)?;
        Ok(self.verify(&receipt))
    }

    /// The current chain head for a tenant.
    #[must_use]
    pub fn chain_head(&self, tenant_id: &str) -> Option<String> {
        self.heads.lock().ok()?.get(tenant_id).cloned()
    }

    /// Verify every receipt and link in a tenant's chain.
    #[must_use]
    pub fn verify_tenant_chain(&self, tenant_id: &str) -> ChainReport {
        let receipts = self.store.list_tenant(tenant_id);
        let mut invalid = Vec::new();
        let mut broken_links = Vec::new();

        for (i, receipt) in receipts.iter().enumerate() {
            if !self.verify(receipt).valid {
                invalid.push(receipt.receipt_id);
            }
            let expected_prior = if i == 0 {
                None
            } else {
                Some(receipts[i - 1].content_hash.clone())
            };
            if receipt.prior_receipt_hash != expected_prior {
                broken_links.push(receipt.receipt_id);
            }
        }

        ChainReport {
            checked: receipts.len(),
            is_valid: invalid.is_empty() && broken_links.is_empty(),
            invalid,
            broken_links,
        }
    }

    /// All receipts for a tenant, oldest first (audit export).
    #[must_use]
    pub fn list_tenant(&self, tenant_id: &str) -> Vec<Receipt> {
        self.store.list_tenant(tenant_id)
    }
}

/// Verify a receipt against an explicit public key.
///
/// When `worm` is supplied and the receipt was exported, the stored WORM
/// content is re-fetched and its hash compared.
#[must_use]
pub fn verify_with_key(
    receipt: &Receipt,
    key: &VerifyingKey,
    worm: Option<&WormSink>,
) -> Verification {
    let recomputed = match acp_crypto::content_hash(&receipt.payload) {
        Ok(hash) => hash,
        Err(e) => return Verification::fail(format!("canonicalization failed: {e}")),
    };
    if recomputed != receipt.content_hash {
        return Verification::fail("content hash mismatch");
    }

    let signature = match acp_crypto::b64_decode(&receipt.signature) {
        Ok(sig) => sig,
        Err(_) => return Verification::fail("signature not decodable"),
    };
    if !acp_crypto::verify(key, receipt.content_hash.as_bytes(), &signature) {
        return Verification::fail("signature invalid");
    }

    if let (Some(uri), Some(sink)) = (&receipt.worm_uri, worm) {
        match sink.fetch(uri) {
            Ok(stored) if stored.content_hash == receipt.content_hash => {}
            Ok(_) => return Verification::fail("worm content diverged"),
            Err(e) => return Verification::fail(format!("worm fetch failed: {e}")),
        }
    }

    Verification::ok()
}

fn poisoned() -> ReceiptError {
    ReceiptError::Storage("chain head lock poisoned".into())
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// A signed receipt for `tenant` backed by a throwaway key and store.
    pub(crate) fn sample_receipt(tenant: &str) -> Receipt {
        let service = ReceiptService::new(Keypair::generate(), Arc::new(ReceiptStore::in_memory()));
        service
            .issue(ReceiptPayload {
                run_id: Uuid::new_v4(),
                plan_hash: "abc123".into(),
                tenant_id: tenant.into(),
                status: RunStatus::Succeeded,
                results_digest: acp_crypto::sha256_hex(b"results"),
                started_at: Utc::now(),
                completed_at: Utc::now(),
                capability_token_jti: Some(Uuid::new_v4().to_string()),
            })
            .expect("sample receipt must issue")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(tenant: &str, run_id: Uuid) -> ReceiptPayload {
        ReceiptPayload {
            run_id,
            plan_hash: "abc123".into(),
            tenant_id: tenant.into(),
            status: RunStatus::Succeeded,
            results_digest: acp_crypto::sha256_hex(b"results"),
            started_at: Utc::now(),
            completed_at: Utc::now(),
            capability_token_jti: None,
        }
    }

    fn service() -> ReceiptService {
        ReceiptService::new(Keypair::generate(), Arc::new(ReceiptStore::in_memory()))
    }

    #[test]
    fn issued_receipt_verifies() {
        let svc = service();
        let receipt = svc.issue(payload("T1", Uuid::new_v4())).unwrap();
        assert!(svc.verify(&receipt).valid);
        assert_eq!(receipt.content_hash.len(), 64);
    }

    #[test]
    fn payload_mutation_breaks_verification() {
        let svc = service();
        let mut receipt = svc.issue(payload("T1", Uuid::new_v4())).unwrap();
        receipt.payload.plan_hash = "evil".into();
        let v = svc.verify(&receipt);
        assert!(!v.valid);
        assert_eq!(v.reason.as_deref(), Some("content hash mismatch"));
    }

    #[test]
    fn signature_flip_breaks_verification() {
        let svc = service();
        let mut receipt = svc.issue(payload("T1", Uuid::new_v4())).unwrap();
        let mut sig = acp_crypto::b64_decode(&receipt.signature).unwrap();
        sig[0] ^= 0x01;
        receipt.signature = acp_crypto::b64_encode(&sig);
        let v = svc.verify(&receipt);
        assert!(!v.valid);
        assert_eq!(v.reason.as_deref(), Some("signature invalid"));
    }

    #[test]
    fn foreign_key_fails_verification() {
        let svc = service();
        let receipt = svc.issue(payload("T1", Uuid::new_v4())).unwrap();
        let other = Keypair::generate();
        assert!(!verify_with_key(&receipt, &other.verifying_key(), None).valid);
    }

    #[test]
    fn chain_links_receipts_per_tenant() {
        let svc = service();
        let first = svc.issue(payload("T1", Uuid::new_v4())).unwrap();
        let second = svc.issue(payload("T1", Uuid::new_v4())).unwrap();
        let other = svc.issue(payload("T2", Uuid::new_v4())).unwrap();

        assert!(first.prior_receipt_hash.is_none());
        assert_eq!(
            second.prior_receipt_hash.as_deref(),
            Some(first.content_hash.as_str())
        );
        // Chains are tenant-local.
        assert!(other.prior_receipt_hash.is_none());
        assert_eq!(svc.chain_head("T1").as_deref(), Some(second.content_hash.as_str()));
    }

    #[test]
    fn tenant_chain_verifies_end_to_end() {
        let svc = service();
        for _ in 0..3 {
            svc.issue(payload("T1", Uuid::new_v4())).unwrap();
        }
        let report = svc.verify_tenant_chain("T1");
        assert_eq!(report.checked, 3);
        assert!(report.is_valid);
    }

    #[test]
    fn verify_by_id_and_tenant_isolation() {
        let svc = service();
        let receipt = svc.issue(payload("T1", Uuid::new_v4())).unwrap();
        assert!(svc.verify_by_id("T1", receipt.receipt_id).unwrap().valid);
        assert!(matches!(
            svc.verify_by_id("T2", receipt.receipt_id),
            Err(ReceiptError::NotFound)
        ));
    }

    #[test]
    fn chain_head_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let seed = Keypair::generate().seed_b64();

        let first_hash = {
            let store = Arc::new(ReceiptStore::open(dir.path()).unwrap());
            let svc = ReceiptService::new(Keypair::from_seed_b64(&seed).unwrap(), store);
            svc.issue(payload("T1", Uuid::new_v4())).unwrap().content_hash
        };

        let store = Arc::new(ReceiptStore::open(dir.path()).unwrap());
        let svc = ReceiptService::new(Keypair::from_seed_b64(&seed).unwrap(), store);
        assert_eq!(svc.chain_head("T1").as_deref(), Some(first_hash.as_str()));

        let second = svc.issue(payload("T1", Uuid::new_v4())).unwrap();
        assert_eq!(second.prior_receipt_hash.as_deref(), Some(first_hash.as_str()));
    }

    #[test]
    fn worm_export_roundtrip_and_verification() {
        let dir = tempfile::tempdir().unwrap();
        let svc = ReceiptService::new(Keypair::generate(), Arc::new(ReceiptStore::in_memory()))
            .with_worm(WormSink::new(dir.path()));

        let mut receipt = svc.issue(payload("T1", Uuid::new_v4())).unwrap();
        let uri = svc.export_worm(&mut receipt).unwrap();
        assert_eq!(receipt.worm_uri.as_deref(), Some(uri.as_str()));
        assert!(svc.verify(&receipt).valid);
    }

    #[test]
    fn export_without_sink_fails() {
        let svc = service();
        let mut receipt = svc.issue(payload("T1", Uuid::new_v4())).unwrap();
        assert!(matches!(
            svc.export_worm(&mut receipt),
            Err(ReceiptError::Storage(_))
        ));
    }

    #[test]
    fn error_codes() {
        assert_eq!(ReceiptError::NotFound.code(), ErrorCode::ReceiptNotFound);
        assert_eq!(
            ReceiptError::ChainContention.code(),
            ErrorCode::ChainHeadContention
        );
    }
}
