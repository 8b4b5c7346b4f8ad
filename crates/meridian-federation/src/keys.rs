//! Ed25519 server signing keys.
//!
//! Each Meridian server holds an Ed25519 key pair used to sign outbound
//! federation requests. Remote servers verify these signatures using the
//! public key from the handshake or from `/_meridian/key/v2/server`.
//!
//! # Key IDs and fingerprints
//! Key IDs follow the Matrix convention: `ed25519:<first 6 pubkey bytes, hex>`.
//! They only name a key. Trust decisions use the fingerprint, which is
//! `SHA256:<hex of sha256(pubkey)>` and is what the key auditor pins.

use std::collections::HashMap;

use base64::Engine as _;
use chrono::{Duration, Utc};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::FederationError;
use crate::types::VerifyKey;

/// How long a key is considered valid before rotation (90 days).
pub const KEY_TTL_DAYS: i64 = 90;

// ─── Key pair ────────────────────────────────────────────────────────────────

/// An Ed25519 signing key pair for this server.
pub struct ServerKeyPair {
    /// Key ID in the format `ed25519:<12-char-hex>`.
    pub key_id: String,
    signing_key: SigningKey,
}

impl ServerKeyPair {
    /// Generate a brand-new random Ed25519 key pair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let key_id = derive_key_id(signing_key.verifying_key().as_bytes());
        Self { key_id, signing_key }
    }

    /// Reconstruct a key pair from its raw 32-byte seed.
    pub fn from_seed(seed: &[u8]) -> Result<Self, FederationError> {
        let bytes: [u8; 32] = seed
            .try_into()
            .map_err(|_| FederationError::KeyLoad("seed must be exactly 32 bytes".into()))?;
        let signing_key = SigningKey::from_bytes(&bytes);
        let key_id = derive_key_id(signing_key.verifying_key().as_bytes());
        Ok(Self { key_id, signing_key })
    }

    /// Reconstruct a key pair from a hex-encoded seed (config file form).
    pub fn from_hex_seed(hex_seed: &str) -> Result<Self, FederationError> {
        let seed = hex::decode(hex_seed.trim())
            .map_err(|e| FederationError::KeyLoad(format!("seed is not valid hex: {e}")))?;
        Self::from_seed(&seed)
    }

    /// Return the 32-byte seed for persistence.
    pub fn seed_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Return the public key as a base64url-encoded string.
    pub fn public_key_base64(&self) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(self.signing_key.verifying_key().as_bytes())
    }

    /// `SHA256:<hex>` fingerprint of the public key.
    pub fn fingerprint(&self) -> String {
        fingerprint_bytes(self.signing_key.verifying_key().as_bytes())
    }

    /// Sign arbitrary bytes and return the base64url-encoded signature.
    pub fn sign_bytes(&self, bytes: &[u8]) -> String {
        let sig = self.signing_key.sign(bytes);
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(sig.to_bytes())
    }

    /// Sign a canonical JSON string and return the base64url-encoded signature.
    pub fn sign_json(&self, canonical_json: &str) -> String {
        self.sign_bytes(canonical_json.as_bytes())
    }

    /// Build the key document served at `/_meridian/key/v2/server`.
    pub fn to_key_document(&self, server_name: &str) -> ServerKeyDocument {
        let mut keys = HashMap::new();
        keys.insert(self.key_id.clone(), VerifyKey { key: self.public_key_base64() });
        ServerKeyDocument {
            server_name: server_name.to_owned(),
            verify_keys: keys,
            valid_until_ts: (Utc::now() + Duration::days(KEY_TTL_DAYS)).timestamp_millis(),
        }
    }
}

// ─── Key document (wire format) ───────────────────────────────────────────────

/// The key document served at `/_meridian/key/v2/server`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerKeyDocument {
    pub server_name: String,
    pub verify_keys: HashMap<String, VerifyKey>,
    /// Unix millisecond timestamp after which this document should be re-fetched.
    pub valid_until_ts: i64,
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Derive a stable key ID from raw public key bytes.
fn derive_key_id(pubkey_bytes: &[u8]) -> String {
    format!("ed25519:{}", hex::encode(&pubkey_bytes[..6]))
}

fn fingerprint_bytes(pubkey_bytes: &[u8]) -> String {
    format!("SHA256:{}", hex::encode(Sha256::digest(pubkey_bytes)))
}

fn decode_public_key(pubkey_base64: &str) -> Result<VerifyingKey, FederationError> {
    let pubkey_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(pubkey_base64)
        .map_err(|_| FederationError::InvalidSignature)?;
    VerifyingKey::from_bytes(
        pubkey_bytes
            .as_slice()
            .try_into()
            .map_err(|_| FederationError::InvalidSignature)?,
    )
    .map_err(|_| FederationError::InvalidSignature)
}

/// Key ID of a base64url public key, as a remote server would advertise it.
pub fn key_id_of(pubkey_base64: &str) -> Result<String, FederationError> {
    Ok(derive_key_id(decode_public_key(pubkey_base64)?.as_bytes()))
}

/// `SHA256:<hex>` fingerprint of a base64url public key.
pub fn fingerprint_of(pubkey_base64: &str) -> Result<String, FederationError> {
    Ok(fingerprint_bytes(decode_public_key(pubkey_base64)?.as_bytes()))
}

/// Verify an Ed25519 signature.
///
/// * `pubkey_base64`: base64url-encoded 32-byte verifying key
/// * `sig_base64`: base64url-encoded 64-byte signature
/// * `message`: original signed bytes
pub fn verify_signature(
    pubkey_base64: &str,
    sig_base64: &str,
    message: &[u8],
) -> Result<(), FederationError> {
    use ed25519_dalek::Verifier;

    let verifying_key = decode_public_key(pubkey_base64)?;

    let sig_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(sig_base64)
        .map_err(|_| FederationError::InvalidSignature)?;
    let signature = ed25519_dalek::Signature::from_bytes(
        sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| FederationError::InvalidSignature)?,
    );

    verifying_key.verify(message, &signature).map_err(|_| FederationError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_sign_verify() {
        let kp = ServerKeyPair::generate();
        let msg = b"hello meridian federation";
        let sig = kp.sign_bytes(msg);
        verify_signature(&kp.public_key_base64(), &sig, msg).expect("signature should verify");
        assert!(verify_signature(&kp.public_key_base64(), &sig, b"tampered").is_err());
    }

    #[test]
    fn from_seed_is_stable() {
        let kp1 = ServerKeyPair::generate();
        let kp2 = ServerKeyPair::from_hex_seed(&hex::encode(kp1.seed_bytes())).unwrap();
        assert_eq!(kp1.key_id, kp2.key_id);
        assert_eq!(kp1.fingerprint(), kp2.fingerprint());
    }

    #[test]
    fn fingerprint_matches_public_key_form() {
        let kp = ServerKeyPair::generate();
        let fp = fingerprint_of(&kp.public_key_base64()).unwrap();
        assert_eq!(fp, kp.fingerprint());
        assert!(fp.starts_with("SHA256:"));
        assert_eq!(fp.len(), "SHA256:".len() + 64);
        assert_eq!(key_id_of(&kp.public_key_base64()).unwrap(), kp.key_id);
    }

    #[test]
    fn short_seed_is_rejected() {
        assert!(matches!(ServerKeyPair::from_seed(&[0u8; 16]), Err(FederationError::KeyLoad(_))));
        assert!(ServerKeyPair::from_hex_seed("zz").is_err());
    }
}
