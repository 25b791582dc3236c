//! Persistence of agent configuration records.
//!
//! Records are grouped per namespace and mutated with an optimistic
//! read-modify-write transaction: the store hands the callback a copy of
//! the namespace's records and writes the result back only when nobody
//! else wrote in between. On conflict the callback runs again on fresh
//! data, so it must not have side effects besides the records it is given
//! and idempotent in-memory markers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use crate::manager::BoxFuture;
use crate::models::agent::AgentConfig;
use crate::{AppError, Result};

/// A namespace's agent configuration records keyed by workload name.
pub type ConfigMap = BTreeMap<String, AgentConfig>;

/// Transaction callback. Returns whether the records were changed.
pub type UpdateFn<'a> = dyn FnMut(&mut ConfigMap) -> Result<bool> + Send + 'a;

/// Number of attempts before an update gives up on conflicts.
pub const MAX_UPDATE_ATTEMPTS: usize = 10;

/// Versioned store of agent configuration records.
pub trait AgentConfigStore: Send + Sync {
    /// Read one record.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Cluster`] when the store is unreachable.
    fn get(&self, name: &str, namespace: &str) -> BoxFuture<'_, Result<Option<AgentConfig>>>;

    /// Run `mutate` against the namespace's records and persist the result
    /// when it reports a change. `mutate` may be invoked more than once.
    ///
    /// # Errors
    ///
    /// Propagates errors returned by `mutate`, and returns
    /// [`AppError::Cluster`] when conflicts persist.
    fn update<'a>(
        &'a self,
        namespace: &'a str,
        mutate: &'a mut UpdateFn<'a>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Delete one record. Deleting a missing record is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Cluster`] when the store is unreachable.
    fn delete(&self, name: &str, namespace: &str) -> BoxFuture<'_, Result<()>>;
}

#[derive(Default, Clone)]
struct VersionedMap {
    version: u64,
    records: ConfigMap,
}

/// In-process [`AgentConfigStore`].
///
/// Concurrent writers are detected through a per-namespace version.
/// [`MemoryConfigStore::inject_conflicts`] forces the next updates to
/// conflict.
#[derive(Default)]
pub struct MemoryConfigStore {
    namespaces: Mutex<HashMap<String, VersionedMap>>,
    pending_conflicts: AtomicUsize,
}

impl MemoryConfigStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` update attempts fail with a version conflict.
    pub fn inject_conflicts(&self, count: usize) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    /// Current version of a namespace's records; zero when never written.
    #[must_use]
    pub fn version(&self, namespace: &str) -> u64 {
        let namespaces = self.namespaces.lock().unwrap_or_else(PoisonError::into_inner);
        namespaces.get(namespace).map_or(0, |m| m.version)
    }

    fn read(&self, namespace: &str) -> VersionedMap {
        let namespaces = self.namespaces.lock().unwrap_or_else(PoisonError::into_inner);
        namespaces.get(namespace).cloned().unwrap_or_default()
    }

    fn take_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn try_update(&self, namespace: &str, mutate: &mut UpdateFn<'_>) -> Result<Option<bool>> {
        let mut working = self.read(namespace);
        let changed = mutate(&mut working.records)?;
        if !changed {
            return Ok(Some(false));
        }

        let mut namespaces = self.namespaces.lock().unwrap_or_else(PoisonError::into_inner);
        let current = namespaces.entry(namespace.to_owned()).or_default();
        if self.take_conflict() {
            current.version += 1;
        }
        if current.version != working.version {
            return Ok(None);
        }
        current.version += 1;
        current.records = working.records;
        Ok(Some(true))
    }
}

impl AgentConfigStore for MemoryConfigStore {
    fn get(&self, name: &str, namespace: &str) -> BoxFuture<'_, Result<Option<AgentConfig>>> {
        let record = self.read(namespace).records.get(name).cloned();
        Box::pin(async move { Ok(record) })
    }

    fn update<'a>(
        &'a self,
        namespace: &'a str,
        mutate: &'a mut UpdateFn<'a>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for attempt in 1..=MAX_UPDATE_ATTEMPTS {
                match self.try_update(namespace, mutate)? {
                    Some(changed) => {
                        debug!(namespace, attempt, changed, "agent config update complete");
                        return Ok(());
                    }
                    None => {
                        warn!(namespace, attempt, "agent config update conflict, retrying");
                        tokio::task::yield_now().await;
                    }
                }
            }
            Err(AppError::Cluster(format!(
                "agent config update in namespace {namespace} failed after {MAX_UPDATE_ATTEMPTS} conflicting attempts"
            )))
        })
    }

    fn delete(&self, name: &str, namespace: &str) -> BoxFuture<'_, Result<()>> {
        {
            let mut namespaces = self.namespaces.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(current) = namespaces.get_mut(namespace) {
                if current.records.remove(name).is_some() {
                    current.version += 1;
                }
            }
        }
        Box::pin(async { Ok(()) })
    }
}
