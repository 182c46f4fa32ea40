// SPDX-License-Identifier: MIT OR Apache-2.0
//! Short-lived signed capability tokens.
//!
//! A capability token binds `{subject, capabilities, tenant}` to a time
//! window of at most [`MAX_TTL_SECS`] seconds for a single execution. The
//! wire form is `<payload>.<signature>`: URL-safe base64 over the canonical
//! JSON claims, Ed25519-signed. Verification consumes the token's jti in a
//! [`ReplayGuard`], so a token authorizes at most one execution.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Append-only audit trail for token operations.
pub mod audit;
/// Replay guards: at-most-once consumption of token ids.
pub mod guard;

pub use audit::{AuditKind, AuditLog, AuditRecord};
pub use guard::{FileReplayGuard, GuardError, InsertOutcome, MemoryReplayGuard, ReplayGuard};

use acp_crypto::Keypair;
use acp_error::ErrorCode;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Hard upper bound on token lifetime, in seconds.
pub const MAX_TTL_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from token operations.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The requested TTL is zero or exceeds [`MAX_TTL_SECS`].
    #[error("requested ttl {requested}s outside (0, {MAX_TTL_SECS}]s")]
    InvalidTtl {
        /// The TTL the caller asked for.
        requested: u64,
    },

    /// The token string is malformed or its signature does not verify.
    #[error("token invalid")]
    Invalid,

    /// The token is past its expiry.
    #[error("token expired")]
    Expired,

    /// The token was minted for a different tenant audience.
    #[error("token audience mismatch")]
    AudienceMismatch,

    /// The token's jti has already been consumed.
    #[error("token replay detected")]
    ReplayDetected,

    /// The replay guard's backing store failed.
    #[error("replay guard failure")]
    Guard(#[from] GuardError),
}

impl TokenError {
    /// The stable error code for this failure.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidTtl { .. } => ErrorCode::InvalidTtl,
            Self::Invalid | Self::AudienceMismatch => ErrorCode::TokenInvalid,
            Self::Expired => ErrorCode::TokenExpired,
            Self::ReplayDetected => ErrorCode::ReplayDetected,
            Self::Guard(_) => ErrorCode::Internal,
        }
    }
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

/// The signed body of a capability token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Unique token id, consumed at most once.
    pub jti: String,
    /// The principal the token was issued to.
    pub sub: String,
    /// Capabilities granted to the subject.
    pub caps: Vec<String>,
    /// Owning tenant.
    pub tenant: String,
    /// Audience: always `tenant:<tenant_id>`.
    pub aud: String,
    /// Issued-at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds. At most `iat + 300`.
    pub exp: i64,
}

impl Claims {
    /// Expiry as a UTC timestamp.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now)
    }

    /// Returns `true` if the claims grant `capability`.
    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.caps.iter().any(|c| c == capability)
    }
}

/// A freshly issued token together with its id and expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedToken {
    /// The wire-form token string.
    pub token: String,
    /// The token's unique id.
    pub jti: String,
    /// Expiry timestamp.
    pub exp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Issues, verifies, refreshes, and revokes capability tokens.
///
/// The signing key sits behind a read-write gate so it can be hot-reloaded;
/// the verification path only ever takes the read side.
pub struct TokenService {
    keys: RwLock<Keypair>,
    guard: Arc<dyn ReplayGuard>,
    audit: AuditLog,
}

impl TokenService {
    /// Create a service around a signing key and a replay guard.
    ///
    /// Production wiring passes a durable [`FileReplayGuard`]; the in-memory
    /// guard is for tests.
    #[must_use]
    pub fn new(keypair: Keypair, guard: Arc<dyn ReplayGuard>) -> Self {
        Self {
            keys: RwLock::new(keypair),
            guard,
            audit: AuditLog::new(),
        }
    }

    /// Replace the signing key. In-flight verifications continue against the
    /// key they already read.
    pub fn rotate_signing_key(&self, keypair: Keypair) {
        if let Ok(mut keys) = self.keys.write() {
            *keys = keypair;
        }
    }

    /// The audit trail.
    #[must_use]
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Issue a token for `subject` with `capabilities`, scoped to `tenant`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::InvalidTtl`] when `ttl_secs` is zero or exceeds
    /// [`MAX_TTL_SECS`].
    pub fn issue(
        &self,
        subject: &str,
        capabilities: &[String],
        ttl_secs: u64,
        tenant: &str,
    ) -> Result<IssuedToken, TokenError> {
        if ttl_secs == 0 || ttl_secs > MAX_TTL_SECS {
            return Err(TokenError::InvalidTtl { requested: ttl_secs });
        }

        let now = Utc::now();
        let claims = Claims {
            jti: Uuid::new_v4().to_string(),
            sub: subject.to_string(),
            caps: capabilities.to_vec(),
            tenant: tenant.to_string(),
            aud: format!("tenant:{tenant}"),
            iat: now.timestamp(),
            exp: now.timestamp() + ttl_secs as i64,
        };

        let token = self.encode(&claims)?;
        debug!(target: "acp.captoken", jti = %claims.jti, tenant, "token issued");
        self.audit
            .record(AuditKind::Issued, &claims.jti, tenant, BTreeMap::new());
        let exp = claims.expires_at();
        Ok(IssuedToken {
            token,
            jti: claims.jti,
            exp,
        })
    }

    /// Verify `token` for `tenant` and consume its jti.
    ///
    /// Validation order: structure and signature, expiry, audience, replay
    /// guard. A second verification of the same jti within its TTL fails with
    /// [`TokenError::ReplayDetected`].
    ///
    /// # Errors
    ///
    /// See [`TokenError`]; every failure is also recorded in the audit trail.
    pub fn verify(&self, token: &str, tenant: &str) -> Result<Claims, TokenError> {
        self.verify_at(token, tenant, Utc::now())
    }

    fn verify_at(&self, token: &str, tenant: &str, now: DateTime<Utc>) -> Result<Claims, TokenError> {
        let claims = match self.decode_and_check(token, tenant, now) {
            Ok(claims) => claims,
            Err(err) => {
                warn!(target: "acp.captoken", tenant, error = %err, "token verification failed");
                self.audit
                    .record(AuditKind::Failed, "unknown", tenant, BTreeMap::new());
                return Err(err);
            }
        };

        match self.guard.insert_if_absent(&claims.jti, claims.expires_at())? {
            InsertOutcome::Inserted => {
                self.audit
                    .record(AuditKind::Verified, &claims.jti, tenant, BTreeMap::new());
                Ok(claims)
            }
            InsertOutcome::AlreadyPresent => {
                warn!(target: "acp.captoken", jti = %claims.jti, tenant, "token replay detected");
                self.audit
                    .record(AuditKind::Failed, &claims.jti, tenant, BTreeMap::new());
                Err(TokenError::ReplayDetected)
            }
        }
    }

    /// Verify `token` and check that it grants `required`.
    ///
    /// Consumes the token's jti like [`verify`](Self::verify).
    ///
    /// # Errors
    ///
    /// Propagates verification failures; an authenticated token that merely
    /// lacks the capability yields `Ok(false)`.
    pub fn check_capability(
        &self,
        token: &str,
        required: &str,
        tenant: &str,
    ) -> Result<bool, TokenError> {
        let claims = self.verify(token, tenant)?;
        Ok(claims.has_capability(required))
    }

    /// Exchange `token` for a fresh one with `new_ttl`, preserving subject,
    /// capabilities, and tenant. The old jti is consumed.
    ///
    /// # Errors
    ///
    /// Fails like [`verify`](Self::verify); in particular a token that was
    /// already used cannot be refreshed.
    pub fn refresh(
        &self,
        token: &str,
        new_ttl: u64,
        tenant: &str,
    ) -> Result<IssuedToken, TokenError> {
        if new_ttl == 0 || new_ttl > MAX_TTL_SECS {
            return Err(TokenError::InvalidTtl { requested: new_ttl });
        }

        let old = self.verify(token, tenant)?;
        let issued = self.issue(&old.sub, &old.caps, new_ttl, tenant)?;
        self.audit
            .record(AuditKind::Refreshed, &old.jti, tenant, BTreeMap::new());
        Ok(issued)
    }

    /// Revoke a token by jti. Idempotent: revoking twice, or revoking an
    /// already-consumed jti, succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Guard`] only on storage failure.
    pub fn revoke(&self, jti: &str, tenant: &str) -> Result<(), TokenError> {
        // Without the claims we cannot know the true expiry; hold the jti for
        // the maximum window a live token could still cover.
        let horizon = Utc::now() + Duration::seconds(MAX_TTL_SECS as i64);
        let _ = self.guard.insert_if_absent(jti, horizon)?;
        self.audit
            .record(AuditKind::Revoked, jti, tenant, BTreeMap::new());
        Ok(())
    }

    // -- encoding -----------------------------------------------------------

    fn encode(&self, claims: &Claims) -> Result<String, TokenError> {
        let payload = acp_crypto::canonical_bytes(claims).map_err(|_| TokenError::Invalid)?;
        let keys = self.keys.read().map_err(|_| TokenError::Invalid)?;
        let signature = keys.sign(&payload);
        Ok(format!(
            "{}.{}",
            acp_crypto::b64_encode(&payload),
            acp_crypto::b64_encode(&signature)
        ))
    }

    fn decode_and_check(
        &self,
        token: &str,
        tenant: &str,
        now: DateTime<Utc>,
    ) -> Result<Claims, TokenError> {
        let (payload_b64, sig_b64) = token.split_once('.').ok_or(TokenError::Invalid)?;
        let payload = acp_crypto::b64_decode(payload_b64).map_err(|_| TokenError::Invalid)?;
        let signature = acp_crypto::b64_decode(sig_b64).map_err(|_| TokenError::Invalid)?;

        let verifying_key = {
            let keys = self.keys.read().map_err(|_| TokenError::Invalid)?;
            keys.verifying_key()
        };
        if !acp_crypto::verify(&verifying_key, &payload, &signature) {
            return Err(TokenError::Invalid);
        }

        let claims: Claims = serde_json::from_slice(&payload).map_err(|_| TokenError::Invalid)?;
        if now.timestamp() > claims.exp {
            return Err(TokenError::Expired);
        }
        if claims.aud != format!("tenant:{tenant}") || claims.tenant != tenant {
            return Err(TokenError::AudienceMismatch);
        }
        Ok(claims)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
