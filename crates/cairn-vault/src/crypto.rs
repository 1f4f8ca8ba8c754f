//! Asymmetric key pairs using the `ring` crate.
//!
//! The pool and every key consumer see a [`KeyPair`] as two opaque byte
//! buffers.  Which cryptosystem fills them is decided by a
//! [`KeyPairSource`]; the default, [`Ed25519Source`], produces:
//!
//! - **private key**: a PKCS#8 v2 document (seed and public key),
//! - **public key**: the raw 32-byte Ed25519 public key.
//!
//! Generation is CPU-bound and synchronous.  Callers on an async runtime
//! should run it on the blocking pool.

use std::fmt;

use ring::rand::SystemRandom;
use ring::signature::{self, Ed25519KeyPair, KeyPair as _};

use crate::error::{Result, VaultError};

/// Length of an Ed25519 public key in bytes.
pub const ED25519_PUBLIC_KEY_LEN: usize = 32;

// ---------------------------------------------------------------------------
// KeyPair
// ---------------------------------------------------------------------------

/// A private/public key pair as opaque bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    /// Encoded private key.  Never logged.
    pub private_key: Vec<u8>,
    /// Encoded public key.
    pub public_key: Vec<u8>,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &format_args!("<{} bytes>", self.private_key.len()))
            .field("public_key", &format_args!("<{} bytes>", self.public_key.len()))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Produces key pairs for the pool.
pub trait KeyPairSource: Send + Sync + 'static {
    /// Short algorithm name used in logs.
    fn algorithm(&self) -> &'static str;

    /// Generate one complete key pair.  Blocks the calling thread.
    fn generate(&self) -> Result<KeyPair>;

    /// Check that `pair` is well formed and internally consistent.
    fn verify(&self, pair: &KeyPair) -> Result<()>;
}

/// Ed25519 key pairs via `ring`.
pub struct Ed25519Source {
    rng: SystemRandom,
}

impl Ed25519Source {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }

    /// Sign `message` with `pair`'s private key.
    pub fn sign(&self, pair: &KeyPair, message: &[u8]) -> Result<Vec<u8>> {
        let key = parse(pair)?;
        Ok(key.sign(message).as_ref().to_vec())
    }

    /// Verify an Ed25519 `sig` over `message` against a raw public key.
    pub fn verify_signature(public_key: &[u8], message: &[u8], sig: &[u8]) -> bool {
        signature::UnparsedPublicKey::new(&signature::ED25519, public_key)
            .verify(message, sig)
            .is_ok()
    }
}

impl Default for Ed25519Source {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyPairSource for Ed25519Source {
    fn algorithm(&self) -> &'static str {
        "ed25519"
    }

    fn generate(&self) -> Result<KeyPair> {
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&self.rng).map_err(|_| {
            VaultError::KeyGenerationFailed {
                reason: "ring failed to generate an Ed25519 PKCS#8 document".into(),
            }
        })?;
        let parsed = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).map_err(|e| {
            VaultError::KeyGenerationFailed {
                reason: format!("generated PKCS#8 document rejected: {e}"),
            }
        })?;

        tracing::trace!("generated ed25519 key pair");

        Ok(KeyPair {
            private_key: pkcs8.as_ref().to_vec(),
            public_key: parsed.public_key().as_ref().to_vec(),
        })
    }

    fn verify(&self, pair: &KeyPair) -> Result<()> {
        let parsed = parse(pair)?;
        if parsed.public_key().as_ref() != pair.public_key.as_slice() {
            return Err(VaultError::InvalidKeyPair {
                reason: "public key does not match private key".into(),
            });
        }
        Ok(())
    }
}

fn parse(pair: &KeyPair) -> Result<Ed25519KeyPair> {
    Ed25519KeyPair::from_pkcs8(&pair.private_key).map_err(|e| VaultError::InvalidKeyPair {
        reason: format!("private key is not a valid Ed25519 PKCS#8 document: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
