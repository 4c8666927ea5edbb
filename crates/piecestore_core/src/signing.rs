//! ed25519 identities and signatures over canonically encoded values.

use std::fmt;
use std::fs;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::Serialize;
use thiserror::Error;

use crate::encoding;
use crate::node_id::NodeId;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("Failed to encode signed value: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Invalid public key {0}")]
    InvalidKey(NodeId),

    #[error("Invalid signature: {0}")]
    InvalidSignature(ed25519_dalek::SignatureError),

    #[error("Identity file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Identity file must contain a 32-byte hex seed")]
    InvalidKeyFile,
}

/// A value that carries its own signature.
///
/// The signature covers the canonical encoding of the value with the
/// signature field emptied.
pub trait Signable: Serialize + Clone {
    fn signature(&self) -> &[u8];

    fn set_signature(&mut self, signature: Vec<u8>);

    fn signing_bytes(&self) -> Result<Vec<u8>, SigningError> {
        let mut unsigned = self.clone();
        unsigned.set_signature(Vec::new());
        Ok(encoding::serialize(&unsigned)?)
    }
}

/// Signing identity of a node, satellite or uplink.
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Load an identity from a file holding the hex-encoded seed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SigningError> {
        let contents = fs::read_to_string(path)?;
        let seed = hex::decode(contents.trim()).map_err(|_| SigningError::InvalidKeyFile)?;
        let seed: [u8; 32] = seed
            .try_into()
            .map_err(|_| SigningError::InvalidKeyFile)?;
        Ok(Self::from_seed(seed))
    }

    /// Write the hex-encoded seed to `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SigningError> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, hex::encode(self.signing_key.to_bytes()))?;
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign_bytes(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// Sign `value`, replacing any signature it already carries.
    pub fn sign<T: Signable>(&self, mut value: T) -> Result<T, SigningError> {
        let bytes = value.signing_bytes()?;
        value.set_signature(self.sign_bytes(&bytes));
        Ok(value)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}

/// Check a raw signature made by `signer`.
pub fn verify_bytes(signer: &NodeId, message: &[u8], signature: &[u8]) -> Result<(), SigningError> {
    let key =
        VerifyingKey::from_bytes(signer.as_bytes()).map_err(|_| SigningError::InvalidKey(*signer))?;
    let signature = Signature::from_slice(signature).map_err(SigningError::InvalidSignature)?;
    key.verify_strict(message, &signature)
        .map_err(SigningError::InvalidSignature)
}

/// Check that `value` carries a valid signature made by `signer`.
pub fn verify<T: Signable>(signer: &NodeId, value: &T) -> Result<(), SigningError> {
    let bytes = value.signing_bytes()?;
    verify_bytes(signer, &bytes, value.signature())
}
