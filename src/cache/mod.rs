// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! TTL-based namespaced caching
//!
//! An in-process expiring key/value store, partitioned into namespaces that
//! each carry their own default TTL. Expiry is lazy: entries are checked and
//! dropped on read, there is no background sweeper. Size-bounded behavior
//! belongs to the caller that owns a namespace, not to this layer.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

/// Errors from the cache layer
#[derive(Debug, Error)]
pub enum CacheError {
    /// A namespace was re-requested with a different value type
    #[error("cache namespace '{namespace}' already exists with a different value type")]
    TypeMismatch {
        /// Name of the conflicting namespace
        namespace: String,
    },
}

struct CacheEntry<V> {
    value: V,
    /// `None` means the entry never expires
    expires_at: Option<Instant>,
}

/// A single named cache partition with its own key space and default TTL
pub struct CacheNamespace<V> {
    name: String,
    default_ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
}

/// Point-in-time statistics for a namespace
#[derive(Debug, Clone)]
pub struct NamespaceStats {
    /// Namespace name
    pub name: String,
    /// Total entries, expired ones included
    pub total: usize,
    /// Expired entries not yet dropped by a lazy read
    pub expired: usize,
}

impl<V: Clone> CacheNamespace<V> {
    fn new(name: &str, default_ttl: Duration) -> Self {
        Self {
            name: name.to_string(),
            default_ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Namespace name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Default TTL applied by [`set`](Self::set)
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Insert a value under the namespace's default TTL
    pub fn set(&self, key: &str, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Insert a value with an explicit TTL
    ///
    /// A zero TTL means the entry never expires.
    pub fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };

        let mut entries = match self.entries.write() {
            Ok(e) => e,
            Err(_) => return,
        };
        entries.insert(key.to_string(), CacheEntry { value, expires_at });
    }

    /// Get a value if present and not expired
    ///
    /// An expired entry is dropped on the spot and reported as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        {
            let entries = self.entries.read().ok()?;
            match entries.get(key) {
                None => return None,
                Some(entry) => {
                    if !Self::is_expired(entry) {
                        return Some(entry.value.clone());
                    }
                }
            }
        }
        // Expired: upgrade to a write lock and drop the entry. Re-check under
        // the write lock since the entry may have been replaced in between.
        if let Ok(mut entries) = self.entries.write() {
            if entries.get(key).map(Self::is_expired) == Some(true) {
                entries.remove(key);
            }
        }
        None
    }

    /// Whether a live (non-expired) entry exists for the key
    ///
    /// Performs the same lazy expiry drop as [`get`](Self::get).
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remove an entry unconditionally
    pub fn del(&self, key: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(key);
        }
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the namespace holds no entries at all
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry in one pass
    ///
    /// For callers that enforce a size cap on their namespace; the store
    /// itself never sweeps.
    pub fn purge_expired(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|_, entry| !Self::is_expired(entry));
        }
    }

    /// Remove all entries
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    /// Current statistics
    pub fn stats(&self) -> NamespaceStats {
        let entries = match self.entries.read() {
            Ok(e) => e,
            Err(_) => {
                return NamespaceStats {
                    name: self.name.clone(),
                    total: 0,
                    expired: 0,
                }
            }
        };
        NamespaceStats {
            name: self.name.clone(),
            total: entries.len(),
            expired: entries.values().filter(|e| Self::is_expired(e)).count(),
        }
    }

    fn is_expired(entry: &CacheEntry<V>) -> bool {
        match entry.expires_at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }
}

/// Registry of cache namespaces, constructed once at startup and passed by
/// reference to every consumer
///
/// Namespace creation is idempotent: the second request for a name returns
/// the existing handle and ignores the newly supplied default TTL.
#[derive(Default)]
pub struct CacheManager {
    namespaces: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl CacheManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the namespace with the given name
    ///
    /// A name is bound to one value type for the life of the manager;
    /// re-requesting it with a different `V` is a
    /// [`CacheError::TypeMismatch`].
    pub fn namespace<V: Clone + Send + Sync + 'static>(
        &self,
        name: &str,
        default_ttl: Duration,
    ) -> Result<Arc<CacheNamespace<V>>, CacheError> {
        {
            let namespaces = self.namespaces.read().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = namespaces.get(name) {
                return Arc::clone(existing)
                    .downcast::<CacheNamespace<V>>()
                    .map_err(|_| CacheError::TypeMismatch {
                        namespace: name.to_string(),
                    });
            }
        }

        let mut namespaces = self.namespaces.write().unwrap_or_else(|e| e.into_inner());
        // Lost the race to another caller between locks: hand out theirs.
        if let Some(existing) = namespaces.get(name) {
            return Arc::clone(existing)
                .downcast::<CacheNamespace<V>>()
                .map_err(|_| CacheError::TypeMismatch {
                    namespace: name.to_string(),
                });
        }

        debug!("Creating cache namespace '{}' (ttl {:?})", name, default_ttl);
        let ns = Arc::new(CacheNamespace::<V>::new(name, default_ttl));
        namespaces.insert(name.to_string(), ns.clone() as Arc<dyn Any + Send + Sync>);
        Ok(ns)
    }

    /// Number of registered namespaces
    pub fn namespace_count(&self) -> usize {
        self.namespaces.read().map(|n| n.len()).unwrap_or(0)
    }
}
