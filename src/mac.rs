//! Drift detection with a keyed MAC
//!
//! The engine never keeps synced secret values around. It keeps an
//! HMAC-SHA256 of them and compares that on the next fetch.

use crate::error::{CredsyncError, CredsyncResult};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::{Map, Value};
use sha2::Sha256;
use std::io::ErrorKind;
use std::path::Path;
use subtle::ConstantTimeEq;
use tokio::fs;
use tracing::{debug, info};

type HmacSha256 = Hmac<Sha256>;

const KEY_LEN: usize = 32;

/// Secret key for data MACs
#[derive(Clone)]
pub struct MacKey {
    key: Vec<u8>,
}

impl MacKey {
    /// Fresh random key
    pub fn generate() -> Self {
        let mut key = vec![0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut key);
        Self { key }
    }

    pub fn from_bytes(key: &[u8]) -> CredsyncResult<Self> {
        if key.len() < 16 {
            return Err(CredsyncError::field("macKey", "key must be at least 16 bytes"));
        }
        Ok(Self { key: key.to_vec() })
    }

    /// Read a hex-encoded key from `path`, or generate one and save it there
    /// if the file does not exist yet.
    pub async fn load_or_create(path: &Path) -> CredsyncResult<Self> {
        match fs::read_to_string(path).await {
            Ok(content) => {
                let bytes = hex::decode(content.trim()).map_err(|e| {
                    CredsyncError::field("macKeyFile", format!("{}: {e}", path.display()))
                })?;
                debug!(path = %path.display(), "Loaded MAC key");
                Self::from_bytes(&bytes)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let key = Self::generate();
                key.save(path).await?;
                info!(path = %path.display(), "Generated MAC key");
                Ok(key)
            }
            Err(e) => Err(CredsyncError::io(
                format!("reading MAC key from {}", path.display()),
                e,
            )),
        }
    }

    async fn save(&self, path: &Path) -> CredsyncResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CredsyncError::io(format!("creating {}", parent.display()), e))?;
        }
        fs::write(path, hex::encode(&self.key))
            .await
            .map_err(|e| CredsyncError::io(format!("writing MAC key to {}", path.display()), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms)
                .map_err(|e| CredsyncError::io("setting MAC key permissions", e))?;
        }
        Ok(())
    }

    /// Hex-encoded MAC of `data`.
    ///
    /// Keys are serialized in sorted order, so equal maps always produce
    /// equal MACs.
    pub fn compute(&self, data: &Map<String, Value>) -> CredsyncResult<String> {
        let payload = serde_json::to_vec(data)?;
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| CredsyncError::Internal(format!("invalid MAC key: {e}")))?;
        mac.update(&payload);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time comparison of a stored MAC against `data`
    pub fn matches(&self, stored: &str, data: &Map<String, Value>) -> CredsyncResult<bool> {
        let computed = self.compute(data)?;
        let (Ok(expected), Ok(actual)) = (hex::decode(stored), hex::decode(&computed)) else {
            return Ok(false);
        };
        if expected.len() != actual.len() {
            return Ok(false);
        }
        Ok(expected.ct_eq(actual.as_slice()).into())
    }
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MacKey(..)")
    }
}
