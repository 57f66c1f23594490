/*
    Copyright © 2024, TenderBFT Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [SignatureScheme] capability trait, and its default Ed25519 implementation.
//!
//! The consensus state machine treats cryptographic identity as an opaque capability: "sign these
//! bytes", "verify these bytes against this public key". Which signature algorithm backs the
//! capability is selected once, at replica construction time, and never special-cased inside the
//! state machine. This keeps the engine agnostic to the scheme in use (classical or post-quantum).

use ed25519_dalek::{Signature, Signer, Verifier};
use rand_core::OsRng;
use sha2::Digest;

pub use ed25519_dalek::{SigningKey, VerifyingKey};

use crate::types::{Address, CryptoHasher, PublicKeyBytes, SignatureBytes};

/// A signing and verifying capability for consensus messages.
///
/// Implementations must be deterministic: signing the same bytes twice must produce signatures that
/// both verify (they need not be byte-identical), and `verify` must agree on all correct replicas.
pub trait SignatureScheme: Clone + Send + 'static {
    /// Sign `message` with this replica's own key.
    fn sign(&self, message: &[u8]) -> SignatureBytes;

    /// The public key bytes identifying this replica.
    fn public(&self) -> PublicKeyBytes;

    /// Verify `signature` over `message` against `public_key`.
    fn verify(public_key: &PublicKeyBytes, message: &[u8], signature: &[u8]) -> bool;

    /// A short name for the scheme, e.g. for logging and key files.
    fn key_type() -> &'static str;
}

/// The default [SignatureScheme], backed by Ed25519.
#[derive(Clone)]
pub struct Ed25519Scheme {
    signing_key: SigningKey,
}

impl Ed25519Scheme {
    pub fn new(signing_key: SigningKey) -> Ed25519Scheme {
        Ed25519Scheme { signing_key }
    }

    /// Generate a fresh random keypair.
    pub fn generate() -> Ed25519Scheme {
        let mut csprng = OsRng {};
        Ed25519Scheme {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl SignatureScheme for Ed25519Scheme {
    fn sign(&self, message: &[u8]) -> SignatureBytes {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    fn public(&self) -> PublicKeyBytes {
        self.signing_key.verifying_key().to_bytes()
    }

    fn verify(public_key: &PublicKeyBytes, message: &[u8], signature: &[u8]) -> bool {
        let verifying_key = match VerifyingKey::from_bytes(public_key) {
            Ok(vk) => vk,
            Err(_) => return false,
        };
        let signature = match Signature::from_slice(signature) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        verifying_key.verify(message, &signature).is_ok()
    }

    fn key_type() -> &'static str {
        "ed25519"
    }
}

/// Derive a validator address from its public key: the first 20 bytes of the key's Sha256 digest.
pub fn address_of(public_key: &PublicKeyBytes) -> Address {
    let mut hasher = CryptoHasher::new();
    hasher.update(public_key);
    let digest: [u8; 32] = hasher.finalize().into();
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest[..20]);
    address
}
