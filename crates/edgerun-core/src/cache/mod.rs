//! Per-cycle service cache.
//!
//! Keeps at most one resolved [`ServiceData`] per service id: the version
//! currently in use by at least one instance. Refreshed from the service
//! manager at the top of each reconcile; entries no longer referenced by any
//! instance are purged at cycle end.
//!
//! Resolution is split from application so the dispatcher can query the
//! service manager without holding the core mutex: [`ServiceCache::resolve`]
//! performs the lookups, [`ServiceCache::apply`] folds the results into the
//! cache under the lock.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::contract::ServiceManager;
use crate::error::{Error, Result};
use crate::model::ServiceData;

/// Cache of resolved service records.
#[derive(Debug, Clone, Default)]
pub struct ServiceCache {
    entries: HashMap<String, ServiceData>,
    broken: HashMap<String, String>,
}

impl ServiceCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up each service id through the service manager.
    ///
    /// Duplicate ids are resolved once.
    pub fn resolve<'a>(
        manager: &dyn ServiceManager,
        service_ids: impl IntoIterator<Item = &'a str>,
    ) -> Vec<(String, Result<ServiceData>)> {
        let mut seen = HashSet::new();
        service_ids
            .into_iter()
            .filter(|id| seen.insert(id.to_string()))
            .map(|id| (id.to_string(), manager.get_service(id)))
            .collect()
    }

    /// Fold resolved lookups into the cache.
    ///
    /// A service whose artifact could not be resolved is recorded as broken;
    /// instances referencing it are later failed without invoking the
    /// runner.
    pub fn apply(&mut self, resolved: Vec<(String, Result<ServiceData>)>) {
        for (service_id, lookup) in resolved {
            match lookup {
                Ok(data) => {
                    self.broken.remove(&service_id);
                    self.entries.insert(service_id, data);
                }
                Err(err) => {
                    warn!(service = %service_id, error = %err, "service artifact unusable");
                    self.entries.remove(&service_id);
                    self.broken.insert(service_id, err.to_string());
                }
            }
        }
    }

    /// Resolved record for a service, if present and usable.
    #[must_use]
    pub fn get(&self, service_id: &str) -> Option<&ServiceData> {
        self.entries.get(service_id)
    }

    /// Why a service is broken, if it is.
    #[must_use]
    pub fn broken_reason(&self, service_id: &str) -> Option<&str> {
        self.broken.get(service_id).map(String::as_str)
    }

    /// Cached version of a service, if any.
    #[must_use]
    pub fn version_of(&self, service_id: &str) -> Option<&str> {
        self.entries.get(service_id).map(|data| data.version.as_str())
    }

    /// Drop every entry whose service id is not in `referenced`.
    pub fn purge_unreferenced(&mut self, referenced: &HashSet<String>) {
        self.entries.retain(|id, _| referenced.contains(id));
        self.broken.retain(|id, _| referenced.contains(id));
    }

    /// Number of usable entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no usable entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
