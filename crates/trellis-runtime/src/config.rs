//! Persisted plugin state: enable flags and permission decisions.
//!
//! The store is the single source of truth for both. It merges on
//! load and on registration, never overwriting a recorded decision,
//! and writes through on every mutation so a crash loses at most the
//! in-flight change.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use trellis_core::{PermissionState, normalize_permission_value};

const SCHEMA_VERSION: u32 = 1;

/// Where a plugin came from, recorded so missing files can be detected
/// on the next discovery pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Builtin,
    Module,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSource {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub module: String,
    pub path: PathBuf,
}

impl PluginSource {
    pub fn builtin(module: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            kind: SourceKind::Builtin,
            module: module.into(),
            path: path.into(),
        }
    }

    pub fn module(module: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            kind: SourceKind::Module,
            module: module.into(),
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPlugin {
    enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<PluginSource>,
    #[serde(default)]
    permissions: BTreeMap<String, PermissionState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConfigDocument {
    version: u32,
    #[serde(default)]
    plugins: BTreeMap<String, StoredPlugin>,
}

/// Snapshot of one plugin's persisted state.
#[derive(Debug, Clone)]
pub struct ConfigEntry {
    pub identifier: String,
    pub enabled: bool,
    pub source: Option<PluginSource>,
    pub permissions: BTreeMap<String, PermissionState>,
}

/// Upgrades any prior document shape to the current schema.
///
/// Version 0 documents stored permission decisions as booleans or
/// free-form strings; those are normalized, never dropped. Unreadable
/// entries are skipped rather than failing the whole document.
fn migrate(raw: serde_json::Value) -> ConfigDocument {
    let version = raw
        .get("version")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);

    if version >= u64::from(SCHEMA_VERSION) {
        if let Ok(document) = serde_json::from_value::<ConfigDocument>(raw) {
            return document;
        }
        tracing::warn!(target: "plugin", "plugin config document is unreadable, starting fresh");
        return ConfigDocument {
            version: SCHEMA_VERSION,
            plugins: BTreeMap::new(),
        };
    }

    let mut plugins = BTreeMap::new();
    if let Some(entries) = raw.get("plugins").and_then(serde_json::Value::as_object) {
        for (identifier, entry) in entries {
            let Some(entry) = entry.as_object() else {
                continue;
            };
            let enabled = entry
                .get("enabled")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(true);
            let source = entry
                .get("source")
                .cloned()
                .and_then(|value| serde_json::from_value(value).ok());
            let mut permissions = BTreeMap::new();
            if let Some(decisions) = entry.get("permissions").and_then(serde_json::Value::as_object)
            {
                for (permission, value) in decisions {
                    permissions.insert(permission.clone(), normalize_permission_value(value));
                }
            }
            plugins.insert(
                identifier.clone(),
                StoredPlugin {
                    enabled,
                    source,
                    permissions,
                },
            );
        }
    }
    ConfigDocument {
        version: SCHEMA_VERSION,
        plugins,
    }
}

/// JSON-file-backed store of per-plugin enable flags and permission
/// decisions. All methods take `&self`; interior state is guarded by a
/// mutex and flushed to disk after every mutation.
#[derive(Debug)]
pub struct PluginConfigStore {
    path: PathBuf,
    state: Mutex<ConfigDocument>,
}

impl PluginConfigStore {
    /// Opens (or initializes) the store at `path`. A missing or
    /// unparseable file yields an empty document; the file is created
    /// on the first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let document = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(raw) => migrate(raw),
                Err(error) => {
                    tracing::warn!(
                        target: "plugin",
                        "ignoring corrupt plugin config at {}: {error}",
                        path.display()
                    );
                    ConfigDocument {
                        version: SCHEMA_VERSION,
                        plugins: BTreeMap::new(),
                    }
                }
            },
            Err(_) => ConfigDocument {
                version: SCHEMA_VERSION,
                plugins: BTreeMap::new(),
            },
        };
        Self {
            path,
            state: Mutex::new(document),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, document: &ConfigDocument) {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let text = serde_json::to_string_pretty(document)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            fs::write(&self.path, text)
        };
        if let Err(error) = write() {
            tracing::error!(
                target: "plugin",
                "failed to persist plugin config to {}: {error}",
                self.path.display()
            );
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConfigDocument> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a plugin, merging with any persisted entry. An
    /// existing entry keeps its enable flag and source; only missing
    /// permission keys are filled in. Returns the effective entry.
    pub fn register_plugin(
        &self,
        identifier: &str,
        default_enabled: bool,
        source: PluginSource,
        permissions: &BTreeMap<String, PermissionState>,
    ) -> ConfigEntry {
        let mut document = self.lock();
        let stored = document
            .plugins
            .entry(identifier.to_string())
            .or_insert_with(|| StoredPlugin {
                enabled: default_enabled,
                source: None,
                permissions: BTreeMap::new(),
            });
        if stored.source.is_none() {
            stored.source = Some(source);
        }
        for (permission, state) in permissions {
            stored.permissions.entry(permission.clone()).or_insert(*state);
        }
        let entry = ConfigEntry {
            identifier: identifier.to_string(),
            enabled: stored.enabled,
            source: stored.source.clone(),
            permissions: stored.permissions.clone(),
        };
        self.persist(&document);
        entry
    }

    pub fn remove_plugin(&self, identifier: &str) {
        let mut document = self.lock();
        if document.plugins.remove(identifier).is_some() {
            self.persist(&document);
        }
    }

    /// Plugins are enabled unless explicitly switched off.
    pub fn is_enabled(&self, identifier: &str) -> bool {
        let document = self.lock();
        document
            .plugins
            .get(identifier)
            .map(|entry| entry.enabled)
            .unwrap_or(true)
    }

    pub fn set_enabled(&self, identifier: &str, enabled: bool) {
        let mut document = self.lock();
        let stored = document
            .plugins
            .entry(identifier.to_string())
            .or_insert_with(|| StoredPlugin {
                enabled,
                source: None,
                permissions: BTreeMap::new(),
            });
        stored.enabled = enabled;
        self.persist(&document);
    }

    pub fn permissions(&self, identifier: &str) -> BTreeMap<String, PermissionState> {
        let document = self.lock();
        document
            .plugins
            .get(identifier)
            .map(|entry| entry.permissions.clone())
            .unwrap_or_default()
    }

    /// Undecided permissions read as `Prompt`.
    pub fn permission_state(&self, identifier: &str, permission: &str) -> PermissionState {
        let document = self.lock();
        document
            .plugins
            .get(identifier)
            .and_then(|entry| entry.permissions.get(permission).copied())
            .unwrap_or_default()
    }

    pub fn set_permission_state(
        &self,
        identifier: &str,
        permission: &str,
        state: PermissionState,
    ) {
        let mut document = self.lock();
        let stored = document
            .plugins
            .entry(identifier.to_string())
            .or_insert_with(|| StoredPlugin {
                enabled: true,
                source: None,
                permissions: BTreeMap::new(),
            });
        stored.permissions.insert(permission.to_string(), state);
        self.persist(&document);
    }

    pub fn all_plugins(&self) -> Vec<ConfigEntry> {
        let document = self.lock();
        document
            .plugins
            .iter()
            .map(|(identifier, stored)| ConfigEntry {
                identifier: identifier.clone(),
                enabled: stored.enabled,
                source: stored.source.clone(),
                permissions: stored.permissions.clone(),
            })
            .collect()
    }
}
