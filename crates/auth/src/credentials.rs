//! Password hashing capability.
//!
//! The hashing scheme is opaque to this crate; deployments plug in whatever
//! implementation stores their digests.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    /// The stored digest could not be parsed.
    #[error("malformed digest: {0}")]
    MalformedDigest(String),

    #[error("credential backend error: {0}")]
    Backend(String),
}

pub trait CredentialVerifier: Send + Sync {
    /// Produce a salted digest for storage.
    fn hash(&self, plaintext: &str) -> Result<String, CredentialError>;

    /// Check a plaintext password against a stored digest.
    fn verify(&self, plaintext: &str, digest: &str) -> Result<bool, CredentialError>;
}
