//! Reference cache
//!
//! Records which tasks (referrers) depend on which shared configuration
//! objects (referents), per dependency kind. Used to fan out resyncs when a
//! shared object changes or is deleted.

use crate::task::ObjectKey;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Kind of shared object a task can depend on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    /// Authentication method configuration
    AuthConfig,
    /// Credential source connection settings
    ConnectionConfig,
    /// Data transformation template
    Transformation,
}

impl RefKind {
    pub fn all() -> &'static [Self] {
        &[Self::AuthConfig, Self::ConnectionConfig, Self::Transformation]
    }
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AuthConfig => "auth-config",
            Self::ConnectionConfig => "connection-config",
            Self::Transformation => "transformation",
        };
        write!(f, "{}", name)
    }
}

type Referents = HashMap<ObjectKey, HashSet<ObjectKey>>;

/// Keyed multimap of referent -> referrers, per kind.
///
/// A referent with no referrers is removed, never stored empty.
#[derive(Default)]
pub struct ReferenceCache {
    inner: RwLock<HashMap<RefKind, Referents>>,
}

impl ReferenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union-insert referrers under a referent
    pub fn add(&self, kind: RefKind, referent: &ObjectKey, referrers: &[ObjectKey]) {
        if referrers.is_empty() {
            return;
        }
        let mut inner = self.write();
        inner
            .entry(kind)
            .or_default()
            .entry(referent.clone())
            .or_default()
            .extend(referrers.iter().cloned());
    }

    /// Replace everything `referrer` depends on under `kind`.
    ///
    /// Applied under one write lock, so readers never see a partial update.
    pub fn set(&self, kind: RefKind, referrer: &ObjectKey, referents: &[ObjectKey]) {
        let wanted: HashSet<&ObjectKey> = referents.iter().collect();
        let mut inner = self.write();
        let by_referent = inner.entry(kind).or_default();

        by_referent.retain(|referent, referrers| {
            if !wanted.contains(referent) {
                referrers.remove(referrer);
            }
            !referrers.is_empty()
        });
        for referent in wanted {
            by_referent
                .entry(referent.clone())
                .or_default()
                .insert(referrer.clone());
        }
        if by_referent.is_empty() {
            inner.remove(&kind);
        }
    }

    /// Referrers of `referent`, or `None` if nothing refers to it
    pub fn get(&self, kind: RefKind, referent: &ObjectKey) -> Option<Vec<ObjectKey>> {
        let inner = self.read();
        let referrers = inner.get(&kind)?.get(referent)?;
        let mut out: Vec<ObjectKey> = referrers.iter().cloned().collect();
        out.sort();
        Some(out)
    }

    /// Referents `referrer` currently depends on under `kind`
    pub fn referents_of(&self, kind: RefKind, referrer: &ObjectKey) -> Vec<ObjectKey> {
        let inner = self.read();
        let mut out: Vec<ObjectKey> = inner
            .get(&kind)
            .map(|by_referent| {
                by_referent
                    .iter()
                    .filter(|(_, referrers)| referrers.contains(referrer))
                    .map(|(referent, _)| referent.clone())
                    .collect()
            })
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Drop a referent and all its associations
    pub fn remove(&self, kind: RefKind, referent: &ObjectKey) -> bool {
        let mut inner = self.write();
        let Some(by_referent) = inner.get_mut(&kind) else {
            return false;
        };
        let removed = by_referent.remove(referent).is_some();
        if by_referent.is_empty() {
            inner.remove(&kind);
        }
        removed
    }

    /// Remove a referrer from every referent under `kind`.
    ///
    /// Returns how many associations were removed.
    pub fn prune(&self, kind: RefKind, referrer: &ObjectKey) -> usize {
        let mut inner = self.write();
        let Some(by_referent) = inner.get_mut(&kind) else {
            return 0;
        };
        let mut count = 0;
        by_referent.retain(|_, referrers| {
            if referrers.remove(referrer) {
                count += 1;
            }
            !referrers.is_empty()
        });
        if by_referent.is_empty() {
            inner.remove(&kind);
        }
        count
    }

    /// Number of referents tracked under `kind`
    pub fn len(&self, kind: RefKind) -> usize {
        self.read().get(&kind).map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<RefKind, Referents>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<RefKind, Referents>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
