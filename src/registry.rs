//! Process-wide cache of shareable OS resources.
//!
//! The registry is the single in-process authority for resource identity,
//! sharing, and teardown ordering. Each entry pairs an owned resource with
//! a reference count; the count tracks logical holders, and the resource's
//! release hook (its `Drop` impl) runs exactly once, at the 1 → 0
//! transition.
//!
//! The registry is not an ambient global: construct one with
//! [`ResourceRegistry::new`] and pass the returned [`RegistryHandle`] to
//! every consumer. [`ResourceRegistry::shutdown`] drains all remaining
//! entries and makes every subsequent operation fail with
//! [`Error::NotReady`], which keeps teardown order explicit and testable.
//!
//! # Example
//!
//! ```rust,ignore
//! use shmblock::registry::ResourceRegistry;
//!
//! let registry = ResourceRegistry::new();
//! registry.add(segment, None)?;          // key derived from the resource
//! registry.add_ref("shm:/my-block")?;    // second holder
//! registry.release_ref("shm:/my-block")?;
//! registry.release_ref("shm:/my-block")?; // last one out releases the OS object
//! ```

use crate::error::{Error, Result};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A capability representing one shareable OS resource.
///
/// The release hook is the implementor's `Drop`: the registry holds the
/// owning [`Arc`] and drops it when the reference count reaches zero.
/// Implementors must be cheap to identify via [`key_name`](Self::key_name),
/// which is used as the registry key when the caller does not supply one.
pub trait SharedResource: Send + Sync + 'static {
    /// Stable key derived from the resource's own identity.
    fn key_name(&self) -> String;

    /// Upcast for downcasting back to the concrete resource type.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Shared handle to a [`ResourceRegistry`], passed to every consumer.
pub type RegistryHandle = Arc<ResourceRegistry>;

struct ResourceEntry {
    resource: Arc<dyn SharedResource>,
    ref_count: usize,
}

type EntryMap = HashMap<String, ResourceEntry>;

/// Process-wide registry of reference-counted shared resources.
///
/// All operations execute under one exclusive lock held for the duration
/// of the lookup or mutation, so reference-count transitions are atomic
/// with respect to concurrent callers. Resources released at the 1 → 0
/// transition are dropped after the lock is given up, so a release hook
/// performing syscalls never runs under the registry lock.
pub struct ResourceRegistry {
    // None once shut down; every operation then fails with NotReady.
    entries: Mutex<Option<EntryMap>>,
}

impl ResourceRegistry {
    /// Create a new, empty registry and return the shared handle to it.
    pub fn new() -> RegistryHandle {
        Arc::new(Self {
            entries: Mutex::new(Some(HashMap::new())),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<EntryMap>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True until [`shutdown`](Self::shutdown) has run.
    pub fn ready(&self) -> bool {
        self.lock().is_some()
    }

    /// Register `resource` under `key`, with an initial reference count of 1.
    ///
    /// When `key` is `None`, the key is derived from the resource's own
    /// [`key_name`](SharedResource::key_name). Fails with
    /// [`Error::DuplicateKey`] if the key is already present; the existing
    /// entry is left untouched and the rejected resource is simply dropped
    /// by the caller.
    pub fn add(&self, resource: Arc<dyn SharedResource>, key: Option<&str>) -> Result<()> {
        let key = match key {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => resource.key_name(),
        };
        let mut guard = self.lock();
        let map = guard.as_mut().ok_or(Error::NotReady)?;
        if map.contains_key(&key) {
            return Err(Error::DuplicateKey { key });
        }
        map.insert(
            key.clone(),
            ResourceEntry {
                resource,
                ref_count: 1,
            },
        );
        drop(guard);
        tracing::debug!(key = %key, "resource registered");
        Ok(())
    }

    /// Add one logical holder to an existing entry.
    pub fn add_ref(&self, key: &str) -> Result<()> {
        let mut guard = self.lock();
        let map = guard.as_mut().ok_or(Error::NotReady)?;
        let entry = map.get_mut(key).ok_or_else(|| Error::NotFound {
            key: key.to_string(),
        })?;
        entry.ref_count += 1;
        Ok(())
    }

    /// Drop one logical holder; the last one out releases the resource.
    ///
    /// Releasing a key that is not registered is not an error: consumers
    /// fire-and-forget their releases.
    pub fn release_ref(&self, key: &str) -> Result<()> {
        let released = {
            let mut guard = self.lock();
            let map = guard.as_mut().ok_or(Error::NotReady)?;
            match map.get_mut(key) {
                Some(entry) if entry.ref_count > 1 => {
                    entry.ref_count -= 1;
                    None
                }
                Some(_) => map.remove(key).map(|entry| entry.resource),
                None => None,
            }
        };
        if let Some(resource) = released {
            tracing::debug!(key = %key, "resource released");
            drop(resource);
        }
        Ok(())
    }

    /// Look up a resource; absence is not an error.
    pub fn find(&self, key: &str) -> Result<Option<Arc<dyn SharedResource>>> {
        let guard = self.lock();
        let map = guard.as_ref().ok_or(Error::NotReady)?;
        Ok(map.get(key).map(|entry| Arc::clone(&entry.resource)))
    }

    /// Look up a resource; fails with [`Error::NotFound`] if absent.
    pub fn get(&self, key: &str) -> Result<Arc<dyn SharedResource>> {
        self.find(key)?.ok_or_else(|| Error::NotFound {
            key: key.to_string(),
        })
    }

    /// True if `key` currently has a live entry.
    pub fn contains(&self, key: &str) -> bool {
        matches!(self.find(key), Ok(Some(_)))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.lock().as_ref().map_or(0, EntryMap::len)
    }

    /// True if no entries are registered (or the registry is shut down).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain every remaining entry, releasing each resource, then mark the
    /// registry closed. Idempotent; subsequent operations fail with
    /// [`Error::NotReady`].
    pub fn shutdown(&self) {
        let drained = self.lock().take();
        if let Some(map) = drained {
            for (key, entry) in map {
                tracing::debug!(key = %key, "resource released at shutdown");
                drop(entry);
            }
        }
    }
}
