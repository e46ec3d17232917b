//! Plugin discovery, dependency evaluation and activation.
//!
//! Discovery walks the search paths, loads every candidate through
//! the configured [`PluginLoader`](crate::plugin::PluginLoader) and
//! builds one runtime record per plugin. A broken candidate becomes a
//! failed record; discovery itself never aborts. Activation runs in
//! dependency order with per-plugin fault isolation.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use thiserror::Error;

use trellis_core::{
    PluginManifest, PluginRuntimeInfo, PluginStatus, ensure_permission_states,
};

use crate::config::PluginSource;
use crate::context::PluginContext;
use crate::host::PluginHost;
use crate::import::ImportPolicy;
use crate::plugin::{ActivationError, Plugin, PluginLoader};

/// File extension of single-file plugin modules.
pub const PLUGIN_EXTENSION: &str = "lua";

/// Entry file names probed inside a plugin directory, in order.
pub const ENTRY_CANDIDATES: [&str; 3] = ["main.lua", "init.lua", "plugin.lua"];

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("plugin package not found: {path}")]
    SourceNotFound { path: PathBuf },
    #[error("unsupported plugin package format: {path}")]
    UnsupportedPackage { path: PathBuf },
    #[error("archive '{path}' contains no plugin entry point")]
    NoEntryPoint { path: PathBuf },
    #[error("a plugin with identifier '{identifier}' already exists")]
    DuplicateIdentifier { identifier: String },
    #[error("builtin plugin '{identifier}' cannot be deleted")]
    DeleteBuiltin { identifier: String },
    #[error("plugins depending on '{identifier}' must be disabled first: {dependents}")]
    HasDependents {
        identifier: String,
        dependents: String,
    },
    #[error("no plugin directory is configured for installs")]
    NoInstallRoot,
    #[error("failed to unpack archive '{path}': {message}")]
    Archive { path: PathBuf, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A plugin whose module loaded and whose record allows activation.
pub struct LoadedPlugin {
    pub identifier: String,
    pub module_name: String,
    pub source_path: PathBuf,
    pub builtin: bool,
    pub manifest: PluginManifest,
    pub plugin: Box<dyn Plugin>,
}

pub struct PluginManager {
    pub(crate) search_paths: Vec<PathBuf>,
    pub(crate) loader: Box<dyn PluginLoader>,
    pub(crate) host: PluginHost,
    pub(crate) builtin_ids: HashSet<String>,
    pub(crate) import_policy: ImportPolicy,
    pub(crate) loaded: Vec<LoadedPlugin>,
    pub(crate) runtime: IndexMap<String, PluginRuntimeInfo>,
}

impl PluginManager {
    pub fn new(
        search_paths: Vec<PathBuf>,
        loader: Box<dyn PluginLoader>,
        host: PluginHost,
        builtin_ids: HashSet<String>,
    ) -> Self {
        Self {
            search_paths,
            loader,
            host,
            builtin_ids,
            import_policy: ImportPolicy::default(),
            loaded: Vec::new(),
            runtime: IndexMap::new(),
        }
    }

    pub fn with_import_policy(mut self, policy: ImportPolicy) -> Self {
        self.import_policy = policy;
        self
    }

    pub fn host(&self) -> &PluginHost {
        &self.host
    }

    /// Destination for imported plugins; the first search path.
    pub(crate) fn install_root(&self) -> Option<&Path> {
        self.search_paths.first().map(PathBuf::as_path)
    }

    pub fn is_builtin(&self, identifier: &str) -> bool {
        self.builtin_ids.contains(identifier)
    }

    pub fn get(&self, identifier: &str) -> Option<&PluginRuntimeInfo> {
        self.runtime.get(identifier)
    }

    /// All records in discovery order.
    pub fn runtime_info(&self) -> Vec<PluginRuntimeInfo> {
        self.runtime.values().cloned().collect()
    }

    pub fn loaded_plugins(&self) -> &[LoadedPlugin] {
        &self.loaded
    }

    pub fn reset(&mut self) {
        self.loaded.clear();
        self.runtime.clear();
    }

    // ---- discovery ---------------------------------------------------

    /// Scans the search paths and rebuilds every runtime record.
    /// Safe to call repeatedly; persisted decisions are merged, never
    /// overwritten.
    pub fn discover(&mut self) {
        self.reset();
        for (module_name, path) in self.collect_candidates() {
            self.process_candidate(&module_name, &path);
        }
        self.mark_missing();
        self.evaluate_dependencies();
        tracing::info!(
            target: "plugin",
            "discovery finished: {} record(s), {} loadable",
            self.runtime.len(),
            self.loaded.len()
        );
    }

    /// Candidates are single `.lua` files and directories containing a
    /// recognizable entry point, ordered by file name within each
    /// search path. The first occurrence of a module name wins.
    fn collect_candidates(&self) -> Vec<(String, PathBuf)> {
        let mut candidates = Vec::new();
        let mut seen = HashSet::new();
        for search_path in &self.search_paths {
            let Ok(entries) = fs::read_dir(search_path) else {
                continue;
            };
            let mut paths: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .collect();
            paths.sort();
            for path in paths {
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if name.starts_with('.') || name.starts_with('_') {
                    continue;
                }
                let module_name = if path.is_dir() {
                    if !directory_has_entry(&path) {
                        continue;
                    }
                    name.to_string()
                } else {
                    match (path.file_stem().and_then(|s| s.to_str()), path.extension()) {
                        (Some(stem), Some(ext)) if ext == PLUGIN_EXTENSION => stem.to_string(),
                        _ => continue,
                    }
                };
                if !seen.insert(module_name.clone()) {
                    tracing::warn!(
                        target: "plugin",
                        "duplicate plugin module '{module_name}' at {}, keeping the first",
                        path.display()
                    );
                    continue;
                }
                candidates.push((module_name, path));
            }
        }
        candidates
    }

    fn record_failure(
        &mut self,
        identifier: &str,
        module_name: &str,
        path: &Path,
        error: String,
    ) {
        if self.runtime.contains_key(identifier) {
            tracing::error!(
                target: "plugin",
                "broken module at {} reuses plugin identifier '{identifier}', ignoring",
                path.display()
            );
            return;
        }
        tracing::warn!(target: "plugin", "plugin '{identifier}' failed to load: {error}");
        self.host.config.register_plugin(
            identifier,
            false,
            PluginSource::module(module_name, path),
            &BTreeMap::new(),
        );
        self.runtime.insert(
            identifier.to_string(),
            PluginRuntimeInfo::failed(
                identifier,
                Some(module_name.to_string()),
                Some(path.to_path_buf()),
                error,
            ),
        );
    }

    fn process_candidate(&mut self, module_name: &str, path: &Path) {
        let plugin = match self.loader.load(module_name, path) {
            Ok(plugin) => plugin,
            Err(error) => {
                self.record_failure(module_name, module_name, path, error.to_string());
                return;
            }
        };
        let manifest = plugin.manifest().clone();
        let identifier = manifest.identifier.clone();

        if let Err(error) = manifest.validate() {
            self.record_failure(module_name, module_name, path, error.to_string());
            return;
        }
        let dependencies = match manifest.dependency_specs() {
            Ok(specs) => specs,
            Err(error) => {
                self.record_failure(&identifier, module_name, path, error.to_string());
                return;
            }
        };
        if self.runtime.contains_key(&identifier) {
            tracing::error!(
                target: "plugin",
                "duplicate plugin identifier '{identifier}' at {}, ignoring",
                path.display()
            );
            return;
        }

        let builtin = self.builtin_ids.contains(&identifier);
        let source = if builtin {
            PluginSource::builtin(module_name, path)
        } else {
            PluginSource::module(module_name, path)
        };
        let states =
            ensure_permission_states(&manifest.permissions, &self.host.config.permissions(&identifier));
        let entry = self
            .host
            .config
            .register_plugin(&identifier, true, source, &states);

        let status = if entry.enabled {
            PluginStatus::Loaded
        } else {
            PluginStatus::Disabled
        };
        let mut info = PluginRuntimeInfo {
            identifier: identifier.clone(),
            manifest: Some(manifest.clone()),
            enabled: entry.enabled,
            status,
            error: None,
            source_path: Some(path.to_path_buf()),
            module_name: Some(module_name.to_string()),
            builtin,
            kind: manifest.kind,
            permissions_required: manifest.permissions.clone(),
            permission_states: entry.permissions,
            permissions_pending: Vec::new(),
            dependencies,
            dependency_issues: Default::default(),
        };
        info.refresh_pending();
        self.runtime.insert(identifier.clone(), info);

        if entry.enabled {
            self.loaded.push(LoadedPlugin {
                identifier,
                module_name: module_name.to_string(),
                source_path: path.to_path_buf(),
                builtin,
                manifest,
                plugin,
            });
        }
    }

    /// Configured plugins whose files vanished become failed records
    /// so the management UI can offer cleanup.
    fn mark_missing(&mut self) {
        for entry in self.host.config.all_plugins() {
            if self.runtime.contains_key(&entry.identifier) {
                continue;
            }
            let (module_name, source_path) = entry
                .source
                .as_ref()
                .map(|source| (Some(source.module.clone()), Some(source.path.clone())))
                .unwrap_or((None, None));
            let mut info = PluginRuntimeInfo::failed(
                &entry.identifier,
                module_name,
                source_path,
                "plugin files are missing",
            );
            info.builtin = self.builtin_ids.contains(&entry.identifier);
            self.runtime.insert(entry.identifier.clone(), info);
        }
    }

    /// Checks every record's dependency constraints against the
    /// versions discovered this pass. Enabled records with unmet
    /// constraints are demoted and dropped from the loadable set.
    pub(crate) fn evaluate_dependencies(&mut self) {
        // A dependency counts only when its own record will load (or
        // already did); a disabled or broken dependency is as good as
        // absent, but gets a more precise reason.
        let available: HashMap<String, (String, bool)> = self
            .runtime
            .values()
            .filter_map(|info| {
                info.manifest.as_ref().map(|m| {
                    let loadable = matches!(
                        info.status,
                        PluginStatus::Loaded | PluginStatus::Active
                    );
                    (info.identifier.clone(), (m.version.clone(), loadable))
                })
            })
            .collect();

        for info in self.runtime.values_mut() {
            if info.manifest.is_none() {
                continue;
            }
            info.dependency_issues.clear();
            for spec in &info.dependencies {
                match available.get(&spec.identifier) {
                    None => {
                        info.dependency_issues.insert(
                            spec.identifier.clone(),
                            format!("required plugin '{}' is not installed", spec.identifier),
                        );
                    }
                    Some((_, false)) => {
                        info.dependency_issues.insert(
                            spec.identifier.clone(),
                            format!("required plugin '{}' is not enabled", spec.identifier),
                        );
                    }
                    Some((version, true)) if !spec.is_satisfied_by(Some(version)) => {
                        info.dependency_issues.insert(
                            spec.identifier.clone(),
                            format!("requires {}, found {version}", spec.describe()),
                        );
                    }
                    Some(_) => {}
                }
            }
            if !info.dependency_issues.is_empty() && info.status == PluginStatus::Loaded {
                info.status = PluginStatus::MissingDependency;
                let summary: Vec<&str> =
                    info.dependency_issues.values().map(String::as_str).collect();
                info.error = Some(summary.join("; "));
            }
        }

        let runtime = &self.runtime;
        self.loaded.retain(|plugin| {
            runtime
                .get(&plugin.identifier)
                .is_some_and(|info| info.status == PluginStatus::Loaded)
        });
    }

    // ---- activation --------------------------------------------------

    /// Topological order over the loadable set (dependencies first).
    /// Ties resolve in discovery order. A dependency cycle falls back
    /// to plain discovery order with a warning.
    pub fn activation_order(&self) -> Vec<String> {
        let discovery_order: Vec<String> = self
            .loaded
            .iter()
            .map(|plugin| plugin.identifier.clone())
            .collect();
        let loadable: HashSet<&str> = discovery_order.iter().map(String::as_str).collect();

        let mut in_degree: IndexMap<&str, usize> = discovery_order
            .iter()
            .map(|id| (id.as_str(), 0))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for plugin in &self.loaded {
            for spec in self
                .runtime
                .get(&plugin.identifier)
                .map(|info| info.dependencies.as_slice())
                .unwrap_or_default()
            {
                if loadable.contains(spec.identifier.as_str())
                    && spec.identifier != plugin.identifier
                {
                    if let Some(degree) = in_degree.get_mut(plugin.identifier.as_str()) {
                        *degree += 1;
                    }
                    dependents
                        .entry(spec.identifier.as_str())
                        .or_default()
                        .push(plugin.identifier.as_str());
                }
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut ordered = Vec::with_capacity(discovery_order.len());
        while let Some(id) = queue.pop_front() {
            ordered.push(id.to_string());
            for &dependent in dependents.get(id).map(Vec::as_slice).unwrap_or_default() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if ordered.len() != discovery_order.len() {
            tracing::warn!(
                target: "plugin",
                "dependency cycle detected, activating in discovery order"
            );
            return discovery_order;
        }
        ordered
    }

    /// Activates every loadable plugin in dependency order. One
    /// plugin's failure (error or panic) marks its record and moves
    /// on; it never prevents the others from activating.
    pub fn activate_all<F>(&mut self, build_context: F)
    where
        F: Fn(&LoadedPlugin) -> Result<PluginContext, ActivationError>,
    {
        for identifier in self.activation_order() {
            let Some(loaded) = self
                .loaded
                .iter()
                .find(|plugin| plugin.identifier == identifier)
            else {
                continue;
            };
            tracing::info!(target: "plugin", "activating '{identifier}'");
            let result = match build_context(loaded) {
                Ok(context) => {
                    catch_unwind(AssertUnwindSafe(|| loaded.plugin.activate(&context)))
                        .unwrap_or_else(|_| Err("plugin activation panicked".into()))
                }
                Err(error) => Err(error),
            };
            let Some(info) = self.runtime.get_mut(&identifier) else {
                continue;
            };
            match result {
                Ok(()) => {
                    info.status = PluginStatus::Active;
                    info.error = None;
                }
                Err(error) => {
                    tracing::warn!(
                        target: "plugin",
                        "activation of '{identifier}' failed: {error}"
                    );
                    info.status = PluginStatus::Error;
                    info.error = Some(error.to_string());
                }
            }
        }
    }

    // ---- management --------------------------------------------------

    /// Flips the persisted enable flag. Takes effect on the next
    /// discovery pass; until then the record is merely marked.
    pub fn set_enabled(&mut self, identifier: &str, enabled: bool) {
        self.host.config.set_enabled(identifier, enabled);
        if let Some(info) = self.runtime.get_mut(identifier) {
            info.enabled = enabled;
        }
    }

    /// Persists a permission decision and refreshes the record.
    pub fn update_permission(
        &mut self,
        identifier: &str,
        permission: &str,
        state: trellis_core::PermissionState,
    ) {
        self.host
            .config
            .set_permission_state(identifier, permission, state);
        if let Some(info) = self.runtime.get_mut(identifier) {
            info.permission_states.insert(permission.to_string(), state);
            info.refresh_pending();
        }
    }

    /// True when a persisted flag or decision differs from what the
    /// running session applied, i.e. a restart would change behavior.
    pub fn has_pending_changes(&self) -> bool {
        for info in self.runtime.values() {
            // A failed record stays failed on restart no matter what
            // the persisted flag says.
            if info.status == PluginStatus::Failed {
                continue;
            }
            let applied_enabled = matches!(
                info.status,
                PluginStatus::Loaded
                    | PluginStatus::Active
                    | PluginStatus::Error
                    | PluginStatus::MissingDependency
            );
            if self.host.config.is_enabled(&info.identifier) != applied_enabled {
                return true;
            }
            let persisted = self.host.config.permissions(&info.identifier);
            for (permission, state) in &info.permission_states {
                if persisted.get(permission).copied().unwrap_or_default() != *state {
                    return true;
                }
            }
        }
        false
    }

    /// Deletes a plugin's files and configuration. Builtins are
    /// refused, as is deleting a plugin that still-enabled plugins
    /// depend on.
    pub fn delete_plugin(&mut self, identifier: &str) -> Result<(), ManagerError> {
        if self.builtin_ids.contains(identifier) {
            return Err(ManagerError::DeleteBuiltin {
                identifier: identifier.to_string(),
            });
        }
        let dependents: Vec<String> = self
            .runtime
            .values()
            .filter(|info| {
                info.identifier != identifier
                    && info.enabled
                    && info
                        .dependencies
                        .iter()
                        .any(|spec| spec.identifier == identifier)
            })
            .map(|info| info.identifier.clone())
            .collect();
        if !dependents.is_empty() {
            return Err(ManagerError::HasDependents {
                identifier: identifier.to_string(),
                dependents: dependents.join(", "),
            });
        }

        let source_path = self
            .runtime
            .get(identifier)
            .and_then(|info| info.source_path.clone());
        if let Some(path) = source_path {
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else if path.is_file() {
                fs::remove_file(&path)?;
            }
        } else {
            tracing::warn!(
                target: "plugin",
                "deleting '{identifier}' with no known source path, removing records only"
            );
        }

        self.host.config.remove_plugin(identifier);
        self.host.events.remove_plugin(identifier);
        self.runtime.shift_remove(identifier);
        self.loaded.retain(|plugin| plugin.identifier != identifier);
        tracing::info!(target: "plugin", "deleted plugin '{identifier}'");
        Ok(())
    }
}

/// True when `path` looks like a plugin directory.
fn directory_has_entry(path: &Path) -> bool {
    ENTRY_CANDIDATES
        .iter()
        .any(|candidate| path.join(candidate).is_file())
        || path.join("plugin.toml").is_file()
}
