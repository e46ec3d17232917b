//! Derived runtime state for each discovered plugin.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::manifest::{DependencySpec, PluginKind, PluginManifest};
use crate::permission::PermissionState;

/// Lifecycle stage of a plugin record. Derived during discovery and
/// activation; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PluginStatus {
    /// Known but not yet discovered this session.
    NotLoaded,
    /// Manifest loaded and validated, not yet activated.
    Loaded,
    /// Activation completed without error.
    Active,
    /// Present but disabled by configuration.
    Disabled,
    /// Discovery or loading failed; see `error`.
    Failed,
    /// Activation or a context construction failed; see `error`.
    Error,
    /// One or more dependency constraints are unsatisfied.
    MissingDependency,
    /// Reserved: blocked on a required permission. Not currently
    /// produced; activation proceeds and individual operations gate.
    PermissionBlocked,
}

/// Everything the host knows about one plugin, suitable for rendering
/// a management UI or a CLI table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRuntimeInfo {
    pub identifier: String,
    pub manifest: Option<PluginManifest>,
    pub enabled: bool,
    pub status: PluginStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub source_path: Option<PathBuf>,
    #[serde(default)]
    pub module_name: Option<String>,
    pub builtin: bool,
    pub kind: PluginKind,
    /// Effective permission set, declared plus any minted at import.
    #[serde(default)]
    pub permissions_required: Vec<String>,
    #[serde(default)]
    pub permission_states: BTreeMap<String, PermissionState>,
    /// Required permissions not yet granted.
    #[serde(default)]
    pub permissions_pending: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    /// Failing dependency identifier to human-readable reason.
    #[serde(default)]
    pub dependency_issues: BTreeMap<String, String>,
}

impl PluginRuntimeInfo {
    /// Skeleton record for a plugin that failed before its manifest
    /// could be read.
    pub fn failed(
        identifier: impl Into<String>,
        module_name: Option<String>,
        source_path: Option<PathBuf>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            manifest: None,
            enabled: false,
            status: PluginStatus::Failed,
            error: Some(error.into()),
            source_path,
            module_name,
            builtin: false,
            kind: PluginKind::default(),
            permissions_required: Vec::new(),
            permission_states: BTreeMap::new(),
            permissions_pending: Vec::new(),
            dependencies: Vec::new(),
            dependency_issues: BTreeMap::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.manifest
            .as_ref()
            .map(|m| m.name.as_str())
            .unwrap_or(&self.identifier)
    }

    pub fn version(&self) -> Option<&str> {
        self.manifest.as_ref().map(|m| m.version.as_str())
    }

    pub fn is_granted(&self, permission: &str) -> bool {
        self.permission_states
            .get(permission)
            .is_some_and(|state| state.is_granted())
    }

    /// Recomputes the pending list from the current decision map.
    pub fn refresh_pending(&mut self) {
        self.permissions_pending = self
            .permissions_required
            .iter()
            .filter(|permission| !self.is_granted(permission))
            .cloned()
            .collect();
    }
}
