//! Shared data store: single-owner namespaces with revisioned entries.
//!
//! Namespaces are announced by exactly one owning plugin; only the
//! owner may publish. Reads may be gated behind a permission chosen by
//! the owner. The store is session-scoped and rebuilt whenever the
//! plugin session restarts.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;

use crate::events::PermissionResolver;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DataStoreError {
    #[error("namespace identifier must not be empty")]
    EmptyNamespace,
    #[error("namespace '{namespace}' is not registered")]
    NamespaceNotFound { namespace: String },
    #[error("namespace '{namespace}' is owned by '{owner}'")]
    NamespaceOwnership { namespace: String, owner: String },
    #[error("entry identifier must not be empty")]
    EmptyEntryId,
    #[error("reading '{namespace}' requires permission '{permission}'")]
    PermissionDenied {
        namespace: String,
        permission: String,
    },
}

/// Immutable view of one stored entry.
#[derive(Debug, Clone, Serialize)]
pub struct DataSnapshot {
    pub namespace: String,
    pub identifier: String,
    pub owner: String,
    pub payload: serde_json::Value,
    /// Starts at 1 and increments on every publish to the same id.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Directory listing of one namespace.
#[derive(Debug, Clone, Serialize)]
pub struct NamespaceSummary {
    pub identifier: String,
    pub owner: String,
    pub description: String,
    pub permission: Option<String>,
    pub entry_count: usize,
    pub latest_entry: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredEntry {
    payload: serde_json::Value,
    revision: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Namespace {
    owner: String,
    description: String,
    permission: Option<String>,
    entries: IndexMap<String, StoredEntry>,
    latest_entry: Option<String>,
}

/// The session-wide store. Insertion order of namespaces and entries
/// is preserved for stable listings.
pub struct GlobalDataStore {
    state: Mutex<IndexMap<String, Namespace>>,
    resolver: Option<PermissionResolver>,
}

impl GlobalDataStore {
    pub fn new(resolver: Option<PermissionResolver>) -> Self {
        Self {
            state: Mutex::new(IndexMap::new()),
            resolver,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IndexMap<String, Namespace>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn can_read(&self, plugin_id: &str, namespace: &Namespace) -> bool {
        let Some(permission) = namespace.permission.as_deref() else {
            return true;
        };
        match &self.resolver {
            Some(resolver) => resolver(plugin_id, permission),
            None => false,
        }
    }

    /// Claims a namespace for `owner`.
    ///
    /// Re-registration by the same owner refreshes the metadata and
    /// keeps the entries. A different owner is rejected unless
    /// `overwrite` is set, in which case ownership transfers and the
    /// previous owner's entries are dropped.
    pub fn register_namespace(
        &self,
        owner: &str,
        identifier: &str,
        description: &str,
        permission: Option<String>,
        overwrite: bool,
    ) -> Result<(), DataStoreError> {
        if identifier.trim().is_empty() {
            return Err(DataStoreError::EmptyNamespace);
        }
        let mut state = self.lock();
        match state.get_mut(identifier) {
            Some(namespace) if namespace.owner == owner => {
                if !description.is_empty() {
                    namespace.description = description.to_string();
                }
                namespace.permission = permission;
                Ok(())
            }
            Some(namespace) if overwrite => {
                tracing::warn!(
                    target: "plugin",
                    "namespace '{identifier}' transferred from '{}' to '{owner}'",
                    namespace.owner
                );
                namespace.owner = owner.to_string();
                namespace.description = description.to_string();
                namespace.permission = permission;
                namespace.entries.clear();
                namespace.latest_entry = None;
                Ok(())
            }
            Some(namespace) => Err(DataStoreError::NamespaceOwnership {
                namespace: identifier.to_string(),
                owner: namespace.owner.clone(),
            }),
            None => {
                state.insert(
                    identifier.to_string(),
                    Namespace {
                        owner: owner.to_string(),
                        description: description.to_string(),
                        permission,
                        entries: IndexMap::new(),
                        latest_entry: None,
                    },
                );
                Ok(())
            }
        }
    }

    /// Publishes (or revises) an entry. Only the namespace owner may
    /// publish; revisions count from 1 and `created_at` never moves.
    pub fn publish(
        &self,
        owner: &str,
        namespace_id: &str,
        entry_id: &str,
        payload: serde_json::Value,
    ) -> Result<DataSnapshot, DataStoreError> {
        if entry_id.trim().is_empty() {
            return Err(DataStoreError::EmptyEntryId);
        }
        let mut state = self.lock();
        let namespace =
            state
                .get_mut(namespace_id)
                .ok_or_else(|| DataStoreError::NamespaceNotFound {
                    namespace: namespace_id.to_string(),
                })?;
        if namespace.owner != owner {
            return Err(DataStoreError::NamespaceOwnership {
                namespace: namespace_id.to_string(),
                owner: namespace.owner.clone(),
            });
        }

        let now = Utc::now();
        let entry = namespace
            .entries
            .entry(entry_id.to_string())
            .and_modify(|entry| {
                entry.payload = payload.clone();
                entry.revision += 1;
                entry.updated_at = now;
            })
            .or_insert_with(|| StoredEntry {
                payload,
                revision: 1,
                created_at: now,
                updated_at: now,
            });
        namespace.latest_entry = Some(entry_id.to_string());

        Ok(DataSnapshot {
            namespace: namespace_id.to_string(),
            identifier: entry_id.to_string(),
            owner: owner.to_string(),
            payload: entry.payload.clone(),
            revision: entry.revision,
            created_at: entry.created_at,
            updated_at: entry.updated_at,
        })
    }

    fn snapshot(namespace_id: &str, namespace: &Namespace, entry_id: &str) -> Option<DataSnapshot> {
        namespace.entries.get(entry_id).map(|entry| DataSnapshot {
            namespace: namespace_id.to_string(),
            identifier: entry_id.to_string(),
            owner: namespace.owner.clone(),
            payload: entry.payload.clone(),
            revision: entry.revision,
            created_at: entry.created_at,
            updated_at: entry.updated_at,
        })
    }

    /// Reads one entry, enforcing the namespace's read permission.
    pub fn get_entry(
        &self,
        reader: &str,
        namespace_id: &str,
        entry_id: &str,
    ) -> Result<Option<DataSnapshot>, DataStoreError> {
        let state = self.lock();
        let namespace = state
            .get(namespace_id)
            .ok_or_else(|| DataStoreError::NamespaceNotFound {
                namespace: namespace_id.to_string(),
            })?;
        if namespace.owner != reader && !self.can_read(reader, namespace) {
            return Err(DataStoreError::PermissionDenied {
                namespace: namespace_id.to_string(),
                permission: namespace.permission.clone().unwrap_or_default(),
            });
        }
        Ok(Self::snapshot(namespace_id, namespace, entry_id))
    }

    /// The most recently published entry in a namespace.
    pub fn latest_entry(
        &self,
        reader: &str,
        namespace_id: &str,
    ) -> Result<Option<DataSnapshot>, DataStoreError> {
        let state = self.lock();
        let namespace = state
            .get(namespace_id)
            .ok_or_else(|| DataStoreError::NamespaceNotFound {
                namespace: namespace_id.to_string(),
            })?;
        if namespace.owner != reader && !self.can_read(reader, namespace) {
            return Err(DataStoreError::PermissionDenied {
                namespace: namespace_id.to_string(),
                permission: namespace.permission.clone().unwrap_or_default(),
            });
        }
        Ok(namespace
            .latest_entry
            .as_deref()
            .and_then(|entry_id| Self::snapshot(namespace_id, namespace, entry_id)))
    }

    pub fn list_entries(
        &self,
        reader: &str,
        namespace_id: &str,
    ) -> Result<Vec<DataSnapshot>, DataStoreError> {
        let state = self.lock();
        let namespace = state
            .get(namespace_id)
            .ok_or_else(|| DataStoreError::NamespaceNotFound {
                namespace: namespace_id.to_string(),
            })?;
        if namespace.owner != reader && !self.can_read(reader, namespace) {
            return Err(DataStoreError::PermissionDenied {
                namespace: namespace_id.to_string(),
                permission: namespace.permission.clone().unwrap_or_default(),
            });
        }
        Ok(namespace
            .entries
            .keys()
            .filter_map(|entry_id| Self::snapshot(namespace_id, namespace, entry_id))
            .collect())
    }

    fn summarize(identifier: &str, namespace: &Namespace) -> NamespaceSummary {
        NamespaceSummary {
            identifier: identifier.to_string(),
            owner: namespace.owner.clone(),
            description: namespace.description.clone(),
            permission: namespace.permission.clone(),
            entry_count: namespace.entries.len(),
            latest_entry: namespace.latest_entry.clone(),
        }
    }

    /// Host-facing directory of every namespace, never gated; the
    /// management UI needs the full picture.
    pub fn list_namespaces(&self) -> Vec<NamespaceSummary> {
        let state = self.lock();
        state
            .iter()
            .map(|(identifier, namespace)| Self::summarize(identifier, namespace))
            .collect()
    }

    /// Namespaces `reader` may see: its own, ungated ones, and gated
    /// ones whose read permission it holds.
    pub fn visible_namespaces(&self, reader: &str) -> Vec<NamespaceSummary> {
        let state = self.lock();
        state
            .iter()
            .filter(|(_, namespace)| {
                namespace.owner == reader || self.can_read(reader, namespace)
            })
            .map(|(identifier, namespace)| Self::summarize(identifier, namespace))
            .collect()
    }

    /// Drops everything; used when the plugin session is rebuilt.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Plugin-facing facade bound to one plugin identifier.
///
/// Reads degrade gracefully: a missing namespace or a denied read
/// yields an empty result instead of an error. Writes surface their
/// errors so an owner hears about ownership conflicts.
#[derive(Clone)]
pub struct GlobalDataAccess {
    plugin_id: String,
    store: Arc<GlobalDataStore>,
}

impl GlobalDataAccess {
    pub fn new(plugin_id: impl Into<String>, store: Arc<GlobalDataStore>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            store,
        }
    }

    pub fn register_namespace(
        &self,
        identifier: &str,
        description: &str,
        permission: Option<String>,
        overwrite: bool,
    ) -> Result<(), DataStoreError> {
        self.store
            .register_namespace(&self.plugin_id, identifier, description, permission, overwrite)
    }

    pub fn publish(
        &self,
        namespace_id: &str,
        entry_id: &str,
        payload: serde_json::Value,
    ) -> Result<DataSnapshot, DataStoreError> {
        self.store
            .publish(&self.plugin_id, namespace_id, entry_id, payload)
    }

    pub fn get(&self, namespace_id: &str, entry_id: &str) -> Option<DataSnapshot> {
        self.store
            .get_entry(&self.plugin_id, namespace_id, entry_id)
            .ok()
            .flatten()
    }

    pub fn latest(&self, namespace_id: &str) -> Option<DataSnapshot> {
        self.store
            .latest_entry(&self.plugin_id, namespace_id)
            .ok()
            .flatten()
    }

    pub fn list(&self, namespace_id: &str) -> Vec<DataSnapshot> {
        self.store
            .list_entries(&self.plugin_id, namespace_id)
            .unwrap_or_default()
    }

    pub fn namespaces(&self) -> Vec<NamespaceSummary> {
        self.store.visible_namespaces(&self.plugin_id)
    }
}
