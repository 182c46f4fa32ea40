// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cryptographic primitives shared by the control plane.
//!
//! Everything that signs, hashes, or canonicalizes goes through this crate so
//! that token issuance, receipt emission, and plan hashing agree byte-for-byte
//! on what they sign. Canonical JSON follows RFC 8785 (JCS) via [`serde_jcs`]:
//! object keys sorted, numbers normalized, no insignificant whitespace.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length in bytes of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Length in bytes of an Ed25519 seed / public key.
pub const KEY_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by the crypto primitives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// A value could not be serialized to canonical JSON.
    #[error("canonical serialization failed: {0}")]
    Canonicalize(String),

    /// Input was not valid URL-safe base64.
    #[error("invalid base64 input")]
    InvalidBase64,

    /// A key had the wrong length or was otherwise malformed.
    #[error("invalid key material (expected {KEY_LEN} bytes)")]
    InvalidKey,

    /// A signature had the wrong length or was otherwise malformed.
    #[error("invalid signature (expected {SIGNATURE_LEN} bytes)")]
    InvalidSignature,
}

// ---------------------------------------------------------------------------
// Canonical JSON + hashing
// ---------------------------------------------------------------------------

/// Serialize `value` to RFC 8785 canonical JSON bytes.
///
/// The output is pure and deterministic: the same value always yields the
/// same bytes, across processes and time.
///
/// # Errors
///
/// Returns [`CryptoError::Canonicalize`] if the value cannot be represented
/// as canonical JSON (e.g. non-finite floats, non-string map keys).
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CryptoError> {
    serde_jcs::to_vec(value).map_err(|e| CryptoError::Canonicalize(e.to_string()))
}

/// Hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hex-encoded SHA-256 of the canonical JSON form of `value`.
///
/// This is the content-address used for plan hashes, idempotency
/// fingerprints, and receipt content hashes.
///
/// # Errors
///
/// Returns [`CryptoError::Canonicalize`] if canonicalization fails.
pub fn content_hash<T: Serialize>(value: &T) -> Result<String, CryptoError> {
    Ok(sha256_hex(&canonical_bytes(value)?))
}

// ---------------------------------------------------------------------------
// Base64
// ---------------------------------------------------------------------------

/// Encode bytes as URL-safe base64 without padding.
#[must_use]
pub fn b64_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode URL-safe unpadded base64.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidBase64`] on malformed input.
pub fn b64_decode(s: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(s.as_bytes())
        .map_err(|_| CryptoError::InvalidBase64)
}

// ---------------------------------------------------------------------------
// Keys and signatures
// ---------------------------------------------------------------------------

/// An Ed25519 keypair used for signing tokens and receipts.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS entropy source.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstruct a keypair from a 32-byte seed.
    #[must_use]
    pub fn from_seed(seed: &[u8; KEY_LEN]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// Reconstruct a keypair from a base64-encoded seed.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidBase64`] or [`CryptoError::InvalidKey`]
    /// on malformed input.
    pub fn from_seed_b64(s: &str) -> Result<Self, CryptoError> {
        let bytes = b64_decode(s)?;
        let seed: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// The base64-encoded seed of this keypair.
    ///
    /// Handle with care: this is the private key.
    #[must_use]
    pub fn seed_b64(&self) -> String {
        b64_encode(&self.signing.to_bytes())
    }

    /// The public half of this keypair.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// The base64-encoded public key.
    #[must_use]
    pub fn public_key_b64(&self) -> String {
        b64_encode(self.signing.verifying_key().as_bytes())
    }

    /// Sign `message`, returning the 64-byte detached signature.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose the seed through Debug.
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key_b64())
            .finish()
    }
}

/// Parse a base64-encoded Ed25519 public key.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidBase64`] or [`CryptoError::InvalidKey`] on
/// malformed input.
pub fn verifying_key_from_b64(s: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = b64_decode(s)?;
    let key_bytes: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| CryptoError::InvalidKey)?;
    VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::InvalidKey)
}

/// Verify a detached Ed25519 signature over `message`.
///
/// Uses strict verification (rejects malleable signatures). Returns `false`
/// for malformed signatures rather than erroring, so callers can treat the
/// result as a plain boolean.
#[must_use]
pub fn verify(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(sig_bytes) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
        return false;
    };
    let sig = Signature::from_bytes(&sig_bytes);
    key.verify_strict(message, &sig).is_ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn canonical_bytes_sorts_keys() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonical_bytes(&a).unwrap(), canonical_bytes(&b).unwrap());
        assert_eq!(
            String::from_utf8(canonical_bytes(&a).unwrap()).unwrap(),
            r#"{"a":2,"b":1}"#
        );
    }

    #[test]
    fn canonical_bytes_is_deterministic() {
        let v = json!({"nested": {"z": [1, 2, 3], "a": "x"}, "n": 42});
        assert_eq!(canonical_bytes(&v).unwrap(), canonical_bytes(&v).unwrap());
    }

    #[test]
    fn sha256_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn content_hash_ignores_key_order() {
        let a = json!({"x": 1, "y": "two"});
        let b = json!({"y": "two", "x": 1});
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn b64_roundtrip() {
        let data = b"\x00\x01\xfe\xff control plane";
        let encoded = b64_encode(data);
        assert!(!encoded.contains('='));
        assert_eq!(b64_decode(&encoded).unwrap(), data);
    }

    #[test]
    fn b64_decode_rejects_garbage() {
        assert_eq!(b64_decode("not!!valid"), Err(CryptoError::InvalidBase64));
    }

    #[test]
    fn sign_verify_roundtrip() {
        let kp = Keypair::generate();
        let msg = b"receipt content hash";
        let sig = kp.sign(msg);
        assert!(verify(&kp.verifying_key(), msg, &sig));
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"original");
        assert!(!verify(&kp.verifying_key(), b"tampered", &sig));
    }

    #[test]
    fn verify_rejects_flipped_signature_byte() {
        let kp = Keypair::generate();
        let msg = b"payload";
        let mut sig = kp.sign(msg);
        sig[0] ^= 0x01;
        assert!(!verify(&kp.verifying_key(), msg, &sig));
    }

    #[test]
    fn verify_rejects_wrong_length_signature() {
        let kp = Keypair::generate();
        assert!(!verify(&kp.verifying_key(), b"msg", &[0u8; 63]));
    }

    #[test]
    fn keypair_seed_roundtrip() {
        let kp = Keypair::generate();
        let restored = Keypair::from_seed_b64(&kp.seed_b64()).unwrap();
        assert_eq!(kp.public_key_b64(), restored.public_key_b64());

        let sig = restored.sign(b"same key, same sig semantics");
        assert!(verify(&kp.verifying_key(), b"same key, same sig semantics", &sig));
    }

    #[test]
    fn public_key_b64_roundtrip() {
        let kp = Keypair::generate();
        let vk = verifying_key_from_b64(&kp.public_key_b64()).unwrap();
        assert_eq!(vk, kp.verifying_key());
    }

    #[test]
    fn verifying_key_from_b64_rejects_short_key() {
        let short = b64_encode(&[0u8; 16]);
        assert_eq!(verifying_key_from_b64(&short), Err(CryptoError::InvalidKey));
    }

    #[test]
    fn debug_does_not_leak_seed() {
        let kp = Keypair::generate();
        let dbg = format!("{kp:?}");
        assert!(!dbg.contains(&kp.seed_b64()));
        assert!(dbg.contains(&kp.public_key_b64()));
    }

    proptest! {
        #[test]
        fn prop_b64_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            prop_assert_eq!(b64_decode(&b64_encode(&data)).unwrap(), data);
        }

        #[test]
        fn prop_content_hash_stable(k in "[a-z]{1,8}", v in any::<i64>()) {
            let value = serde_json::json!({ k.clone(): v });
            prop_assert_eq!(content_hash(&value).unwrap(), content_hash(&value).unwrap());
        }

        #[test]
        fn prop_sign_verify(msg in proptest::collection::vec(any::<u8>(), 0..512)) {
            let kp = Keypair::from_seed(&[7u8; 32]);
            let sig = kp.sign(&msg);
            prop_assert!(verify(&kp.verifying_key(), &msg, &sig));
        }
    }
}
