//! Structured client cache keys
//!
//! A key is `(auth method, config hash)` plus an optional source-side
//! namespace. Keys with equal method and hash share one authenticated
//! identity, whatever their namespace.

use crate::error::{CredsyncError, CredsyncResult};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length of the hex config hash
const HASH_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientCacheKey {
    method: String,
    config_hash: String,
    namespace: Option<String>,
}

impl ClientCacheKey {
    /// Derive a key from an auth method and its serialized configuration
    pub fn compute<T: Serialize>(
        method: &str,
        config: &T,
        namespace: Option<&str>,
    ) -> CredsyncResult<Self> {
        let method = method.trim().to_ascii_lowercase();
        if method.is_empty() {
            return Err(CredsyncError::field("method", "auth method must not be empty"));
        }

        // serde_json maps are ordered, so equal configs hash equally
        let canonical = serde_json::to_vec(&serde_json::to_value(config)?)?;
        let digest = Sha256::digest(&canonical);
        let mut config_hash = hex::encode(digest);
        config_hash.truncate(HASH_LEN);

        Ok(Self {
            method,
            config_hash,
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// The key without its namespace suffix
    pub fn parent(&self) -> Self {
        Self {
            namespace: None,
            ..self.clone()
        }
    }

    /// Same method and config hash, i.e. the same authenticated identity
    pub fn same_parent(&self, other: &Self) -> bool {
        self.method == other.method && self.config_hash == other.config_hash
    }

    /// Same identity, different namespace
    pub fn with_namespace(&self, namespace: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()).filter(|ns| !ns.is_empty()),
            ..self.clone()
        }
    }
}

impl fmt::Display for ClientCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.method, self.config_hash)?;
        if let Some(ns) = &self.namespace {
            write!(f, "/{}", ns)?;
        }
        Ok(())
    }
}

impl FromStr for ClientCacheKey {
    type Err = CredsyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid =
            |reason: &str| CredsyncError::field("clientCacheKey", format!("{s:?}: {reason}"));

        let (parent, namespace) = match s.split_once('/') {
            Some((parent, ns)) if !ns.is_empty() => (parent, Some(ns.to_string())),
            Some(_) => return Err(invalid("empty namespace suffix")),
            None => (s, None),
        };
        let (method, hash) = parent
            .rsplit_once('-')
            .ok_or_else(|| invalid("expected <method>-<hash>"))?;
        if method.is_empty() {
            return Err(invalid("empty method"));
        }
        if hash.len() != HASH_LEN || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid("malformed config hash"));
        }

        Ok(Self {
            method: method.to_string(),
            config_hash: hash.to_string(),
            namespace,
        })
    }
}
