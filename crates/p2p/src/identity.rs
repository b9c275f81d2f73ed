//! Persistent node identity

use alloy_primitives::{B256, B512};
use reth_network_peers::{id2pk, pk2id, PeerId};
use secp256k1::{ecdsa::Signature, Message, PublicKey, SecretKey, SECP256K1};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::info;

/// Identity errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("failed to access node key {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt node key {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// On-disk shape of the node key
#[derive(Debug, Serialize, Deserialize)]
struct NodeKeyFile {
    id: String,
    priv_key: String,
}

/// Node key pair and the identifier derived from its public key.
///
/// Immutable once loaded; cloning is cheap.
#[derive(Clone)]
pub struct NodeKey {
    secret_key: SecretKey,
    id: PeerId,
}

impl NodeKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        Self::from_secret_key(SecretKey::new(&mut rand::thread_rng()))
    }

    /// Wrap an existing secret key
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let id = pk2id(&secret_key.public_key(SECP256K1));
        Self { secret_key, id }
    }

    /// Load the key at `path`, or generate and save a new one if the file is absent.
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            let key = Self::load(path)?;
            info!(id = %key.id, path = %path.display(), "Loaded node key");
            Ok(key)
        } else {
            let key = Self::generate();
            key.save(path)?;
            info!(id = %key.id, path = %path.display(), "Generated new node key");
            Ok(key)
        }
    }

    /// Load an existing key file
    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let corrupt = |reason: String| IdentityError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let contents = fs::read_to_string(path).map_err(|source| IdentityError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: NodeKeyFile =
            serde_json::from_str(&contents).map_err(|e| corrupt(e.to_string()))?;

        let bytes = hex::decode(file.priv_key.trim()).map_err(|e| corrupt(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(corrupt("invalid secret key length".to_string()));
        }
        let secret_key = SecretKey::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
        let key = Self::from_secret_key(secret_key);

        let stored_id =
            crate::address::parse_peer_id(&file.id).map_err(|e| corrupt(e.to_string()))?;
        if stored_id != key.id {
            return Err(corrupt("stored id does not match key".to_string()));
        }

        Ok(key)
    }

    /// Save key to file
    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        let io_err = |source| IdentityError::Io {
            path: path.to_path_buf(),
            source,
        };

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = NodeKeyFile {
            id: hex::encode(self.id),
            priv_key: hex::encode(self.secret_key.secret_bytes()),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| io_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        let mut out = fs::File::create(path).map_err(io_err)?;
        out.write_all(json.as_bytes()).map_err(io_err)?;
        // Set file permissions to owner-only read/write on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(io_err)?;
        }
        Ok(())
    }

    /// Stable node identifier
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Secret key, used by the encrypted transport
    pub fn secret_key(&self) -> SecretKey {
        self.secret_key
    }

    /// Public key
    pub fn public_key(&self) -> PublicKey {
        self.secret_key.public_key(SECP256K1)
    }

    /// Sign a 32 byte digest, returning the compact signature
    pub fn sign(&self, digest: B256) -> B512 {
        let message = Message::from_digest(digest.0);
        let signature = SECP256K1.sign_ecdsa(&message, &self.secret_key);
        B512::from(signature.serialize_compact())
    }
}

impl std::fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKey")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Verify a compact signature over `digest` against the key behind `id`.
pub fn verify(id: &PeerId, digest: B256, signature: &B512) -> bool {
    let Ok(public_key) = id2pk(*id) else {
        return false;
    };
    let Ok(signature) = Signature::from_compact(signature.as_slice()) else {
        return false;
    };
    let message = Message::from_digest(digest.0);
    SECP256K1.verify_ecdsa(&message, &signature, &public_key).is_ok()
}
