//! Managed resource registry.
//!
//! The fleet is a local cache of the resources the reconciler manages. It is
//! never authoritative: the provider is re-read on every job, and the cached
//! state only serves the admin API.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;
use warden_cloud::{ObservedState, ResourceKind, ResourceRef};

/// Cached view of one managed resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resource {
    pub id: String,
    pub kind: ResourceKind,
    /// State seen by the last successful inspection
    pub observed: Option<ObservedState>,
    pub last_reconciled: Option<DateTime<Utc>>,
}

impl Resource {
    #[must_use]
    pub fn to_ref(&self) -> ResourceRef {
        ResourceRef::new(self.id.clone(), self.kind)
    }
}

#[derive(Debug)]
struct Entry {
    resource: Resource,
    cancel: CancellationToken,
}

/// Set of managed resources with one cancellation token each.
#[derive(Debug, Default)]
pub struct Fleet {
    entries: RwLock<HashMap<String, Entry>>,
}

impl Fleet {
    /// Build a fleet from resource references.
    #[must_use]
    pub fn from_refs(resources: impl IntoIterator<Item = ResourceRef>) -> Self {
        let entries = resources
            .into_iter()
            .map(|r| {
                let entry = Entry {
                    resource: Resource {
                        id: r.id.clone(),
                        kind: r.kind,
                        observed: None,
                        last_reconciled: None,
                    },
                    cancel: CancellationToken::new(),
                };
                (r.id, entry)
            })
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Remove a resource and cancel its pending work.
    pub async fn remove(&self, id: &str) -> Option<Resource> {
        let entry = self.entries.write().await.remove(id)?;
        entry.cancel.cancel();
        info!(resource_id = %id, "Resource removed from fleet");
        Some(entry.resource)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    pub async fn get(&self, id: &str) -> Option<Resource> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|e| e.resource.clone())
    }

    /// Provider reference and cancellation token for a managed resource.
    pub async fn lease(&self, id: &str) -> Option<(ResourceRef, CancellationToken)> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|e| (e.resource.to_ref(), e.cancel.clone()))
    }

    /// Cache the state seen by an inspection.
    pub async fn record(&self, id: &str, observed: ObservedState, at: DateTime<Utc>) {
        if let Some(entry) = self.entries.write().await.get_mut(id) {
            entry.resource.observed = Some(observed);
            entry.resource.last_reconciled = Some(at);
        }
    }

    /// Managed ids, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// All cached resources, sorted by id.
    pub async fn snapshot(&self) -> Vec<Resource> {
        let mut resources: Vec<Resource> = self
            .entries
            .read()
            .await
            .values()
            .map(|e| e.resource.clone())
            .collect();
        resources.sort_by(|a, b| a.id.cmp(&b.id));
        resources
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
