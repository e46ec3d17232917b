//! Importing plugin packages from user-supplied files.
//!
//! A package is a single `.lua` module or a `.zip`/`.tar.gz` archive.
//! The entry script is scanned for `require` statements before the
//! plugin ever runs; modules outside the allow-list each mint a
//! synthetic `external-library:<root>` permission that starts
//! ungranted. Imported third-party plugins are registered disabled.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde::Deserialize;

use trellis_core::{PluginManifest, PluginRuntimeInfo, PluginStatus, ensure_permission_states};

use crate::config::PluginSource;
use crate::manager::{ENTRY_CANDIDATES, ManagerError, PLUGIN_EXTENSION, PluginManager};

/// Which `require` targets a plugin may use without a grant.
#[derive(Debug, Clone)]
pub struct ImportPolicy {
    /// Module roots that are always available (the scripting
    /// standard library and the host API).
    pub allowed_modules: HashSet<String>,
    /// Full-name prefixes that are always available, e.g. `trellis.`.
    pub allowed_prefixes: Vec<String>,
    /// Directories whose contents count as first-party libraries.
    pub library_paths: Vec<PathBuf>,
}

impl Default for ImportPolicy {
    fn default() -> Self {
        Self {
            allowed_modules: [
                "string", "table", "math", "os", "io", "coroutine", "utf8", "trellis",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            allowed_prefixes: vec!["trellis.".to_string()],
            library_paths: Vec::new(),
        }
    }
}

impl ImportPolicy {
    /// True when `module` needs no synthetic permission.
    pub fn is_allowed(&self, module: &str) -> bool {
        let root = module_root(module);
        if self.allowed_modules.contains(root) {
            return true;
        }
        if self
            .allowed_prefixes
            .iter()
            .any(|prefix| module.starts_with(prefix.as_str()))
        {
            return true;
        }
        self.library_paths.iter().any(|path| {
            path.join(format!("{root}.{PLUGIN_EXTENSION}")).is_file() || path.join(root).is_dir()
        })
    }
}

/// Outcome of one import. `error` is set when the package installed
/// but its module could not be validated; the files stay in place so
/// the next discovery pass reports the same failure.
#[derive(Debug)]
pub struct ImportResult {
    pub destination: PathBuf,
    pub module_name: String,
    pub identifier: Option<String>,
    pub manifest: Option<PluginManifest>,
    /// Effective permission set, including minted
    /// `external-library:` entries.
    pub requested_permissions: Vec<String>,
    pub error: Option<String>,
}

fn module_root(module: &str) -> &str {
    module
        .split(['.', '/'])
        .next()
        .unwrap_or(module)
}

/// Collects every statically visible `require` target from a Lua
/// source. Only literal `require "x"` / `require("x")` forms are
/// recognized; line comments are stripped first. Dynamic requires are
/// invisible here by design of the scan, not a grant.
pub fn collect_required_modules(source: &str) -> BTreeSet<String> {
    let mut modules = BTreeSet::new();
    for line in source.lines() {
        let code = match line.find("--") {
            Some(index) => &line[..index],
            None => line,
        };
        let mut rest = code;
        while let Some(position) = rest.find("require") {
            let before_ok = position == 0
                || rest[..position]
                    .chars()
                    .next_back()
                    .is_none_or(|c| !c.is_ascii_alphanumeric() && c != '_');
            let after = &rest[position + "require".len()..];
            rest = after;
            if !before_ok {
                continue;
            }
            let mut chars = after.trim_start();
            if let Some(stripped) = chars.strip_prefix('(') {
                chars = stripped.trim_start();
            }
            let Some(quote) = chars.chars().next().filter(|c| *c == '"' || *c == '\'') else {
                continue;
            };
            let body = &chars[1..];
            if let Some(end) = body.find(quote) {
                let module = &body[..end];
                if !module.is_empty() {
                    modules.insert(module.to_string());
                }
            }
        }
    }
    modules
}

#[derive(Debug, Deserialize)]
struct PackageMetadata {
    entry: Option<String>,
}

enum PackageFormat {
    Script,
    Zip,
    TarGz,
}

fn sanitize_stem(stem: &str) -> String {
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() {
        "plugin".to_string()
    } else {
        trimmed.to_string()
    }
}

fn remove_payload(path: &Path) {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(error) = result {
        tracing::warn!(
            target: "plugin",
            "failed to clean up {}: {error}",
            path.display()
        );
    }
}

/// Finds the entry script inside an unpacked package directory.
///
/// Precedence: `plugin.toml`'s `entry` key, then the well-known entry
/// names. A directory holding exactly one `.lua` file has it renamed
/// to `main.lua`. A single nested directory (the usual zip layout) is
/// hoisted first.
fn resolve_entry(dir: &Path) -> Result<PathBuf, ManagerError> {
    hoist_single_directory(dir)?;

    let metadata_path = dir.join("plugin.toml");
    if metadata_path.is_file() {
        let text = fs::read_to_string(&metadata_path)?;
        match toml::from_str::<PackageMetadata>(&text) {
            Ok(metadata) => {
                if let Some(entry) = metadata.entry {
                    let candidate = dir.join(&entry);
                    if candidate.is_file() {
                        return Ok(candidate);
                    }
                    tracing::warn!(
                        target: "plugin",
                        "plugin.toml names missing entry '{entry}', probing defaults"
                    );
                }
            }
            Err(error) => {
                tracing::warn!(target: "plugin", "unreadable plugin.toml: {error}");
            }
        }
    }

    for candidate in ENTRY_CANDIDATES {
        let path = dir.join(candidate);
        if path.is_file() {
            return Ok(path);
        }
    }

    let scripts: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file() && path.extension().is_some_and(|ext| ext == PLUGIN_EXTENSION)
        })
        .collect();
    if let [only] = scripts.as_slice() {
        let target = dir.join(ENTRY_CANDIDATES[0]);
        fs::rename(only, &target)?;
        return Ok(target);
    }

    Err(ManagerError::NoEntryPoint {
        path: dir.to_path_buf(),
    })
}

/// Archives often wrap their contents in one top-level directory;
/// move such contents up so the package root is the plugin root.
fn hoist_single_directory(dir: &Path) -> std::io::Result<()> {
    let children: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    let [only] = children.as_slice() else {
        return Ok(());
    };
    if !only.is_dir() {
        return Ok(());
    }
    let nested: Vec<PathBuf> = fs::read_dir(only)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    for path in nested {
        if let Some(name) = path.file_name() {
            fs::rename(&path, dir.join(name))?;
        }
    }
    fs::remove_dir_all(only)?;
    Ok(())
}

impl PluginManager {
    /// Installs a plugin package and registers it.
    ///
    /// Third-party imports land disabled; the user flips them on after
    /// reviewing the requested permissions. The entry script is
    /// scanned before registration, and every off-list `require` root
    /// becomes an ungranted `external-library:` permission.
    pub fn import_plugin(&mut self, source: &Path) -> Result<ImportResult, ManagerError> {
        if !source.exists() {
            return Err(ManagerError::SourceNotFound {
                path: source.to_path_buf(),
            });
        }
        if source.is_dir() {
            return Err(ManagerError::UnsupportedPackage {
                path: source.to_path_buf(),
            });
        }
        let install_root = self
            .install_root()
            .ok_or(ManagerError::NoInstallRoot)?
            .to_path_buf();
        fs::create_dir_all(&install_root)?;

        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ManagerError::UnsupportedPackage {
                path: source.to_path_buf(),
            })?;
        let lower = file_name.to_ascii_lowercase();
        let (format, raw_stem) = if let Some(stem) = lower.strip_suffix(".lua") {
            (PackageFormat::Script, stem.to_string())
        } else if let Some(stem) = lower.strip_suffix(".zip") {
            (PackageFormat::Zip, stem.to_string())
        } else if let Some(stem) = lower.strip_suffix(".tar.gz") {
            (PackageFormat::TarGz, stem.to_string())
        } else if let Some(stem) = lower.strip_suffix(".tgz") {
            (PackageFormat::TarGz, stem.to_string())
        } else {
            return Err(ManagerError::UnsupportedPackage {
                path: source.to_path_buf(),
            });
        };
        let stem = sanitize_stem(&raw_stem);

        // Pick a destination that does not collide with an installed
        // module.
        let mut module_name = stem.clone();
        let mut counter = 1;
        let destination = loop {
            let candidate = match format {
                PackageFormat::Script => {
                    install_root.join(format!("{module_name}.{PLUGIN_EXTENSION}"))
                }
                _ => install_root.join(&module_name),
            };
            if !candidate.exists() {
                break candidate;
            }
            module_name = format!("{stem}_{counter}");
            counter += 1;
        };

        let entry_path = match format {
            PackageFormat::Script => {
                fs::copy(source, &destination)?;
                destination.clone()
            }
            PackageFormat::Zip => {
                let file = fs::File::open(source)?;
                let mut archive =
                    zip::ZipArchive::new(file).map_err(|error| ManagerError::Archive {
                        path: source.to_path_buf(),
                        message: error.to_string(),
                    })?;
                archive
                    .extract(&destination)
                    .map_err(|error| ManagerError::Archive {
                        path: source.to_path_buf(),
                        message: error.to_string(),
                    })?;
                match resolve_entry(&destination) {
                    Ok(path) => path,
                    Err(error) => {
                        remove_payload(&destination);
                        return Err(error);
                    }
                }
            }
            PackageFormat::TarGz => {
                let file = fs::File::open(source)?;
                let mut archive = tar::Archive::new(GzDecoder::new(file));
                archive
                    .unpack(&destination)
                    .map_err(|error| ManagerError::Archive {
                        path: source.to_path_buf(),
                        message: error.to_string(),
                    })?;
                match resolve_entry(&destination) {
                    Ok(path) => path,
                    Err(error) => {
                        remove_payload(&destination);
                        return Err(error);
                    }
                }
            }
        };

        // Static source scan, before the module ever runs.
        let entry_source = fs::read_to_string(&entry_path)?;
        let mut synthetic: Vec<String> = collect_required_modules(&entry_source)
            .iter()
            .filter(|module| !self.import_policy.is_allowed(module.as_str()))
            .map(|module| self.host.catalog.mint_external_library(module_root(module.as_str())))
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect();

        let plugin = match self.loader.load(&module_name, &destination) {
            Ok(plugin) => plugin,
            Err(error) => {
                tracing::warn!(
                    target: "plugin",
                    "imported package '{module_name}' failed to load: {error}"
                );
                return Ok(ImportResult {
                    destination,
                    module_name,
                    identifier: None,
                    manifest: None,
                    requested_permissions: synthetic,
                    error: Some(error.to_string()),
                });
            }
        };
        let manifest = plugin.manifest().clone();
        let identifier = manifest.identifier.clone();

        if let Err(error) = manifest
            .validate()
            .and_then(|()| manifest.dependency_specs().map(|_| ()))
        {
            return Ok(ImportResult {
                destination,
                module_name,
                identifier: Some(identifier),
                manifest: Some(manifest),
                requested_permissions: synthetic,
                error: Some(error.to_string()),
            });
        }
        if self.runtime.contains_key(&identifier) {
            remove_payload(&destination);
            return Err(ManagerError::DuplicateIdentifier { identifier });
        }

        // Effective permission set: declared plus minted.
        let mut effective = manifest.permissions.clone();
        synthetic.retain(|permission| !effective.contains(permission));
        effective.extend(synthetic.iter().cloned());

        let builtin = self.builtin_ids.contains(&identifier);
        let states = ensure_permission_states(
            &effective,
            &self.host.config.permissions(&identifier),
        );
        let entry = self.host.config.register_plugin(
            &identifier,
            builtin,
            PluginSource::module(&module_name, &destination),
            &states,
        );
        // Imports never start enabled, even when a stale persisted
        // entry says otherwise.
        let enabled = if builtin {
            entry.enabled
        } else {
            if entry.enabled {
                self.host.config.set_enabled(&identifier, false);
            }
            false
        };

        let dependencies = manifest.dependency_specs().unwrap_or_default();
        let mut info = PluginRuntimeInfo {
            identifier: identifier.clone(),
            manifest: Some(manifest.clone()),
            enabled,
            status: if enabled {
                PluginStatus::Loaded
            } else {
                PluginStatus::Disabled
            },
            error: None,
            source_path: Some(destination.clone()),
            module_name: Some(module_name.clone()),
            builtin,
            kind: manifest.kind,
            permissions_required: effective.clone(),
            permission_states: self.host.config.permissions(&identifier),
            permissions_pending: Vec::new(),
            dependencies,
            dependency_issues: Default::default(),
        };
        info.refresh_pending();
        self.runtime.insert(identifier.clone(), info);
        self.evaluate_dependencies();

        tracing::info!(
            target: "plugin",
            "imported plugin '{identifier}' from {} (disabled: {})",
            source.display(),
            !enabled
        );
        Ok(ImportResult {
            destination,
            module_name,
            identifier: Some(identifier),
            manifest: Some(manifest),
            requested_permissions: effective,
            error: None,
        })
    }
}
