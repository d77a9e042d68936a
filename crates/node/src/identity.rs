//! Node identity.
//!
//! A weft node holds an Ed25519 keypair and signs every reservation result
//! it produces, so observers can attribute results to this node. The secret
//! is kept as a hex file under the node's data directory and generated on
//! first boot.
//!
//! ## Safety
//!
//! - Private key bytes are never exposed via any public method.
//! - The key file is written with owner-only permissions.

use std::fs;
use std::path::Path;

use ed25519_dalek::SigningKey;
use thiserror::Error;
use tracing::info;

use weft_common::crypto::{self, CryptoError};
use weft_engine::ResultSigner;

/// Errors from loading or creating the node identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to access identity file: {0}")]
    Io(#[from] std::io::Error),

    #[error("identity file is corrupt: {0}")]
    Corrupt(#[from] CryptoError),
}

/// The node's signing identity.
#[derive(Debug)]
pub struct NodeIdentity {
    signing_key: SigningKey,
    node_id: String,
}

impl NodeIdentity {
    /// Load the identity from `path`, generating and persisting a fresh
    /// keypair if the file does not exist yet.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let path = path.as_ref();
        let signing_key = if path.exists() {
            crypto::signing_key_from_hex(&fs::read_to_string(path)?)?
        } else {
            let key = crypto::generate_keypair();
            write_secret(path, &hex::encode(key.to_bytes()))?;
            info!(path = %path.display(), "generated new node identity");
            key
        };
        let node_id = crypto::public_key_hex(&signing_key);
        Ok(NodeIdentity { signing_key, node_id })
    }

    /// Hex public key; doubles as the node's stable identifier.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

impl ResultSigner for NodeIdentity {
    fn sign(&self, challenge: &[u8]) -> String {
        crypto::sign_challenge(&self.signing_key, challenge)
    }
}

#[cfg(unix)]
fn write_secret(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut f = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .mode(0o600)
        .open(path)?;
    f.write_all(contents.as_bytes())?;
    f.sync_all()
}

#[cfg(not(unix))]
fn write_secret(path: &Path, contents: &str) -> std::io::Result<()> {
    fs::write(path, contents)
}
