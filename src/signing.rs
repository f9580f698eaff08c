//! Identity and signing collaborators for outbound control messages.

use ed25519_dalek::{Signer, SigningKey};
use secrecy::{ExposeSecret, SecretVec};
use serde::Serialize;
use thiserror::Error;

/// Private signing key material, kept out of `Debug` output.
pub type PrivateKey = SecretVec<u8>;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("signing manager is nil")]
    MissingSigner,

    #[error("invalid private key: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("{0}")]
    Backend(String),
}

/// Identity under which the client registers.
pub trait Identity: Send + Sync {
    /// Serialized creator identity embedded in every control message.
    fn serialized_identity(&self) -> Result<Vec<u8>, IdentityError>;

    /// Key material handed to the [`SigningManager`].
    fn private_key(&self) -> &PrivateKey;
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct IdentityError(pub String);

/// Signs serialized control messages.
pub trait SigningManager: Send + Sync {
    fn sign(&self, payload: &[u8], key: &PrivateKey) -> Result<Vec<u8>, SignError>;
}

/// Ed25519 signer over a 32-byte secret seed.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519SigningManager;

impl SigningManager for Ed25519SigningManager {
    fn sign(&self, payload: &[u8], key: &PrivateKey) -> Result<Vec<u8>, SignError> {
        let seed: &[u8; 32] =
            key.expose_secret()
                .as_slice()
                .try_into()
                .map_err(|_| SignError::InvalidKeyLength {
                    expected: ed25519_dalek::SECRET_KEY_LENGTH,
                    actual: key.expose_secret().len(),
                })?;
        let signing_key = SigningKey::from_bytes(seed);
        Ok(signing_key.sign(payload).to_bytes().to_vec())
    }
}

#[derive(Serialize)]
struct SerializedIdentity<'a> {
    mspid: &'a str,
    id_bytes: &'a str,
}

/// Membership identity: MSP id, enrollment certificate and private key.
pub struct SigningIdentity {
    msp_id: String,
    certificate_pem: String,
    private_key: PrivateKey,
}

impl SigningIdentity {
    pub fn new(
        msp_id: impl Into<String>,
        certificate_pem: impl Into<String>,
        private_key: PrivateKey,
    ) -> Self {
        Self {
            msp_id: msp_id.into(),
            certificate_pem: certificate_pem.into(),
            private_key,
        }
    }

    pub fn msp_id(&self) -> &str {
        &self.msp_id
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("msp_id", &self.msp_id)
            .finish_non_exhaustive()
    }
}

impl Identity for SigningIdentity {
    fn serialized_identity(&self) -> Result<Vec<u8>, IdentityError> {
        if self.msp_id.is_empty() {
            return Err(IdentityError("msp id is required".to_string()));
        }
        serde_json::to_vec(&SerializedIdentity {
            mspid: &self.msp_id,
            id_bytes: &self.certificate_pem,
        })
        .map_err(|err| IdentityError(format!("serialize identity: {err}")))
    }

    fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }
}
