//! Ed25519 identities.
//!
//! Every dmsg endpoint, client or relay, is addressed solely by its Ed25519
//! public key. The secret half signs discovery entries and the connection
//! hello; it never leaves the process.

use crate::error::{Error, Result};
use ed25519_dalek::{Signer, Verifier};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::ZeroizeOnDrop;

/// Public key size in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Ed25519 public key identifying an endpoint
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PubKey([u8; PUBLIC_KEY_SIZE]);

impl PubKey {
    /// Create from raw bytes (not checked for curve validity)
    #[must_use]
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice of exactly 32 bytes
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if the slice has the wrong length.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let bytes: [u8; PUBLIC_KEY_SIZE] = slice.try_into().map_err(|_| Error::InvalidKey)?;
        Ok(Self(bytes))
    }

    /// Parse a 64-character hex string
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] on bad hex or wrong length.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|_| Error::InvalidKey)?;
        Self::from_slice(&bytes)
    }

    /// Raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// True for the all-zero key, which never identifies a real endpoint
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; PUBLIC_KEY_SIZE]
    }

    /// Short hex form for log lines
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Verify a signature made by the matching secret key
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if the bytes are not a curve point and
    /// [`Error::AuthFailed`] if the signature does not authenticate `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.0).map_err(|_| Error::InvalidKey)?;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify(message, &sig)
            .map_err(|_| Error::auth("signature does not verify"))
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", self.short())
    }
}

/// Ed25519 signature (64 bytes)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_SIZE]);

impl Signature {
    /// Create a signature from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a signature from a slice
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthFailed`] if the slice is not exactly 64 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let bytes: [u8; SIGNATURE_SIZE] = slice
            .try_into()
            .map_err(|_| Error::auth("signature must be 64 bytes"))?;
        Ok(Self(bytes))
    }

    /// Get the raw signature bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

/// Ed25519 secret key
///
/// Zeroized on drop to prevent key material from lingering in memory.
#[derive(ZeroizeOnDrop)]
pub struct SecretKey {
    inner: ed25519_dalek::SigningKey,
}

impl SecretKey {
    /// Generate a new random secret key
    #[must_use]
    pub fn generate() -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from a raw 32-byte seed
    #[must_use]
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    /// Parse a 64-character hex seed
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] on bad hex or wrong length.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|_| Error::InvalidKey)?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| Error::InvalidKey)?;
        Ok(Self::from_bytes(&seed))
    }

    /// Export the seed as hex (handle with care)
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.inner.to_bytes())
    }

    /// The matching public key
    #[must_use]
    pub fn public_key(&self) -> PubKey {
        PubKey(self.inner.verifying_key().to_bytes())
    }

    /// Sign a message (deterministic)
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.inner.sign(message).to_bytes())
    }
}

impl Clone for SecretKey {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}
