//! Signature seam for user-owned souls.
//!
//! The merge engine does not know how signatures are produced or checked;
//! it talks to the [`Verifier`] trait. This crate provides the ed25519
//! implementation used by real nodes, plus the [`Keypair`] a node uses as
//! its identity. A signature covers the canonical JSON of
//! `[value, state]` and lives in the node's `_.s` map under the
//! stringified state, so verification is a lookup by state followed by a
//! check against the field's value at that state.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use mesh_primitives::{State, Value};
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CryptoError {
    #[error("malformed public key")]
    InvalidKey,
    #[error("malformed signature")]
    InvalidSignature,
}

/// Checks write signatures for `~pub` souls.
///
/// Implementations must be pure: the same inputs always yield the same
/// answer, and a failed check must not observably differ from a mismatch.
pub trait Verifier: Send + Sync {
    /// Whether `sig` (the `_.s` entry for `state`) is a valid signature
    /// of `(value, state)` under the key encoded in the soul suffix
    /// `pub_key`.
    fn verify(&self, pub_key: &str, value: &Value, state: State, sig: &str) -> bool;
}

/// Produces write signatures for the local identity.
pub trait Signer: Send + Sync {
    fn sign(&self, value: &Value, state: State) -> String;
}

/// The canonical byte payload both sides sign and verify.
#[must_use]
pub fn signed_payload(value: &Value, state: State) -> Vec<u8> {
    serde_json::to_vec(&(value, state)).unwrap_or_default()
}

/// An ed25519 node identity. The hex form of the verifying key doubles as
/// the peer id and as the `~<pub>` soul suffix.
#[derive(Clone, Debug)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut rand::thread_rng()),
        }
    }

    #[must_use]
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Hex encoding of the verifying key: the node's stable id.
    #[must_use]
    pub fn public_key(&self) -> String {
        hex::encode(self.signing.verifying_key().as_bytes())
    }

    /// The user-owned soul for this identity: `~<pub>`.
    #[must_use]
    pub fn soul(&self) -> String {
        format!("~{}", self.public_key())
    }
}

impl Signer for Keypair {
    fn sign(&self, value: &Value, state: State) -> String {
        let payload = signed_payload(value, state);
        hex::encode(self.signing.sign(&payload).to_bytes())
    }
}

/// Stateless ed25519 verifier.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519Verifier;

impl Ed25519Verifier {
    fn decode_key(pub_key: &str) -> Result<VerifyingKey, CryptoError> {
        let bytes: [u8; 32] = hex::decode(pub_key)
            .map_err(|_| CryptoError::InvalidKey)?
            .try_into()
            .map_err(|_| CryptoError::InvalidKey)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::InvalidKey)
    }

    fn decode_sig(sig: &str) -> Result<Signature, CryptoError> {
        let bytes: [u8; 64] = hex::decode(sig)
            .map_err(|_| CryptoError::InvalidSignature)?
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Signature::from_bytes(&bytes))
    }
}

impl Verifier for Ed25519Verifier {
    fn verify(&self, pub_key: &str, value: &Value, state: State, sig: &str) -> bool {
        let (Ok(key), Ok(sig)) = (Self::decode_key(pub_key), Self::decode_sig(sig)) else {
            return false;
        };
        let payload = signed_payload(value, state);
        key.verify(&payload, &sig).is_ok()
    }
}
