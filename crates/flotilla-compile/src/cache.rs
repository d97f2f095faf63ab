//! Compiled-package cache.
//!
//! Content-addressed: the key is the package identity plus its
//! dependency-closure fingerprint. Entries are immutable; a changed
//! dependency produces a new key rather than overwriting an old entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Cache key: (package identity, dependency fingerprint).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub package: String,
    pub version: String,
    pub fingerprint: String,
}

/// Immutable reference to a compiled artifact in the blobstore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledPackage {
    pub package: String,
    pub version: String,
    pub fingerprint: String,
    /// Blobstore reference to the compiled artifact.
    pub artifact_blob: String,
}

/// In-memory content-addressed store of compiled packages.
///
/// Cheap to clone; clones share state. Injectable so the orchestrator can
/// carry one across runs and tests can inspect it.
#[derive(Debug, Clone, Default)]
pub struct CompiledPackageCache {
    inner: Arc<Mutex<HashMap<CacheKey, CompiledPackage>>>,
}

impl CompiledPackageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<CompiledPackage> {
        self.lock().get(key).cloned()
    }

    /// Insert a compiled package. A present entry is never overwritten:
    /// entries are immutable once written.
    pub fn insert(&self, compiled: CompiledPackage) {
        let key = CacheKey {
            package: compiled.package.clone(),
            version: compiled.version.clone(),
            fingerprint: compiled.fingerprint.clone(),
        };
        let mut map = self.lock();
        if map.contains_key(&key) {
            debug!(package = %key.package, "compiled package already cached, keeping existing entry");
            return;
        }
        map.insert(key, compiled);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, CompiledPackage>> {
        // Recover from a poisoned lock: the map itself is always valid.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiled(artifact: &str) -> CompiledPackage {
        CompiledPackage {
            package: "router".into(),
            version: "12".into(),
            fingerprint: "fp".into(),
            artifact_blob: artifact.into(),
        }
    }

    #[test]
    fn get_after_insert() {
        let cache = CompiledPackageCache::new();
        cache.insert(compiled("blob-1"));
        let key = CacheKey {
            package: "router".into(),
            version: "12".into(),
            fingerprint: "fp".into(),
        };
        assert_eq!(cache.get(&key).unwrap().artifact_blob, "blob-1");
    }

    #[test]
    fn entries_are_immutable() {
        let cache = CompiledPackageCache::new();
        cache.insert(compiled("blob-1"));
        cache.insert(compiled("blob-2"));
        let key = CacheKey {
            package: "router".into(),
            version: "12".into(),
            fingerprint: "fp".into(),
        };
        // First write wins; the entry is superseded only by a new key.
        assert_eq!(cache.get(&key).unwrap().artifact_blob, "blob-1");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn clones_share_state() {
        let cache = CompiledPackageCache::new();
        let clone = cache.clone();
        cache.insert(compiled("blob-1"));
        assert_eq!(clone.len(), 1);
    }
}
