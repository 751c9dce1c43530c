//! Ed25519 caller signatures.
//!
//! A caller identity is the hex encoding of its 32-byte Ed25519 public key.
//! The signature is the hex encoding of a 64-byte Ed25519 signature over the
//! message supplied by the gateway.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use tracing::debug;

use routing::{Identity, SignatureVerifier};

#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl Ed25519Verifier {
    fn decode_key(identity: &Identity) -> Option<VerifyingKey> {
        let bytes: [u8; 32] = hex::decode(identity.as_str()).ok()?.try_into().ok()?;
        VerifyingKey::from_bytes(&bytes).ok()
    }

    fn decode_signature(signature: &str) -> Option<Signature> {
        let bytes: [u8; 64] = hex::decode(signature.trim()).ok()?.try_into().ok()?;
        Some(Signature::from_bytes(&bytes))
    }
}

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, identity: &Identity, message: &[u8], signature: &str) -> bool {
        let Some(key) = Self::decode_key(identity) else {
            debug!(%identity, "Identity is not a hex Ed25519 public key");
            return false;
        };
        let Some(signature) = Self::decode_signature(signature) else {
            debug!(%identity, "Signature is not 64 hex-encoded bytes");
            return false;
        };
        key.verify(message, &signature).is_ok()
    }
}
