//! trellis - manage plugins for a trellis host.
//!
//! Usage:
//!   trellis list                     Show every plugin record
//!   trellis import <PACKAGE>         Install a .lua/.zip/.tar.gz package
//!   trellis delete <ID>              Remove a plugin and its files
//!   trellis enable/disable <ID>      Flip the persisted enable flag
//!   trellis grant/deny <ID> <PERM>   Record a permission decision
//!   trellis permissions              Show the capability catalog

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Context, Result, bail};

use trellis_core::{PermissionState, PluginKind, PluginManifest};
use trellis_runtime::{
    ActivationError, Plugin, PluginConfigStore, PluginContext, PluginHost, PluginManager,
    StaticPluginLoader,
};

const CORE_IDENTIFIER: &str = "trellis.core";

#[derive(Parser)]
#[command(
    name = "trellis",
    version,
    about = "A permissioned plugin runtime for extensible host applications"
)]
struct Cli {
    /// Host data directory (defaults to the platform data dir)
    #[arg(long)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every plugin record with status and pending permissions
    List,

    /// Import a plugin package (.lua, .zip or .tar.gz)
    Import {
        /// Package file to install
        package: PathBuf,
    },

    /// Delete an installed plugin and its configuration
    Delete {
        /// Plugin identifier
        identifier: String,
    },

    /// Enable a plugin (takes effect on the next start)
    Enable { identifier: String },

    /// Disable a plugin (takes effect on the next start)
    Disable { identifier: String },

    /// Record a granted permission decision
    Grant {
        identifier: String,
        permission: String,
    },

    /// Record a denied permission decision
    Deny {
        identifier: String,
        permission: String,
    },

    /// Show the capability catalog
    Permissions,
}

/// The host's own plugin. It announces the lifecycle events other
/// plugins build on.
struct CorePlugin {
    manifest: PluginManifest,
}

impl CorePlugin {
    fn new() -> Self {
        Self {
            manifest: PluginManifest::new(
                CORE_IDENTIFIER,
                "Trellis Core",
                env!("CARGO_PKG_VERSION"),
            )
            .with_description("Host lifecycle events and base services")
            .with_author("trellis")
            .with_kind(PluginKind::Library),
        }
    }
}

impl Plugin for CorePlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn activate(&self, context: &PluginContext) -> Result<(), ActivationError> {
        context.register_event("host.startup", "The host finished starting", None);
        context.register_event("host.shutdown", "The host is about to exit", None);
        Ok(())
    }
}

fn default_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("trellis")
}

fn build_manager(root: &PathBuf) -> Result<PluginManager> {
    let plugins_dir = root.join("plugins");
    fs::create_dir_all(&plugins_dir)
        .with_context(|| format!("cannot create {}", plugins_dir.display()))?;

    // Native builtins keep a file marker so discovery sees them like
    // any other module.
    let core_marker = plugins_dir.join("core.lua");
    if !core_marker.exists() {
        fs::write(&core_marker, "-- trellis core (native module)\n")
            .context("cannot write core plugin marker")?;
    }

    let config = Arc::new(PluginConfigStore::new(
        root.join("config").join("plugins.json"),
    ));
    let host = PluginHost::new(config);

    let mut loader = StaticPluginLoader::new();
    loader.register("core", || Box::new(CorePlugin::new()));

    let builtins: HashSet<String> = [CORE_IDENTIFIER.to_string()].into();
    Ok(PluginManager::new(
        vec![plugins_dir],
        Box::new(loader),
        host,
        builtins,
    ))
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let root = cli.root.unwrap_or_else(default_root);

    match cli.command {
        Command::List => {
            let mut manager = build_manager(&root)?;
            manager.discover();
            print_plugin_table(&manager);
        }
        Command::Import { package } => {
            let mut manager = build_manager(&root)?;
            manager.discover();
            let result = manager
                .import_plugin(&package)
                .with_context(|| format!("failed to import {}", package.display()))?;
            println!("Installed to {}", result.destination.display());
            match (&result.identifier, &result.error) {
                (Some(identifier), None) => {
                    println!("Registered '{identifier}' (disabled until enabled)");
                }
                (_, Some(error)) => {
                    println!("Package installed but could not be validated: {error}");
                }
                _ => {}
            }
            if !result.requested_permissions.is_empty() {
                println!("Requested permissions:");
                for permission in &result.requested_permissions {
                    println!("  - {permission}");
                }
            }
        }
        Command::Delete { identifier } => {
            let mut manager = build_manager(&root)?;
            manager.discover();
            manager
                .delete_plugin(&identifier)
                .with_context(|| format!("failed to delete '{identifier}'"))?;
            println!("Deleted '{identifier}'");
        }
        Command::Enable { identifier } => {
            set_enabled(&root, &identifier, true)?;
        }
        Command::Disable { identifier } => {
            set_enabled(&root, &identifier, false)?;
        }
        Command::Grant {
            identifier,
            permission,
        } => {
            set_permission(&root, &identifier, &permission, PermissionState::Granted)?;
        }
        Command::Deny {
            identifier,
            permission,
        } => {
            set_permission(&root, &identifier, &permission, PermissionState::Denied)?;
        }
        Command::Permissions => {
            let manager = build_manager(&root)?;
            println!("{:<32} {:<24} DESCRIPTION", "ID", "NAME");
            println!("{}", "─".repeat(88));
            for info in manager.host().catalog.entries() {
                println!("{:<32} {:<24} {}", info.id, info.name, info.description);
            }
        }
    }

    Ok(())
}

fn set_enabled(root: &PathBuf, identifier: &str, enabled: bool) -> Result<()> {
    let mut manager = build_manager(root)?;
    manager.discover();
    if manager.get(identifier).is_none() {
        bail!("unknown plugin '{identifier}'");
    }
    manager.set_enabled(identifier, enabled);
    println!(
        "'{identifier}' is now {} (takes effect on the next start)",
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

fn set_permission(
    root: &PathBuf,
    identifier: &str,
    permission: &str,
    state: PermissionState,
) -> Result<()> {
    let mut manager = build_manager(root)?;
    manager.discover();
    if manager.get(identifier).is_none() {
        bail!("unknown plugin '{identifier}'");
    }
    manager.update_permission(identifier, permission, state);
    println!("'{identifier}': {permission} -> {state}");
    Ok(())
}

fn print_plugin_table(manager: &PluginManager) {
    let records = manager.runtime_info();
    if records.is_empty() {
        println!("No plugins installed.");
        return;
    }
    println!(
        "{:<28} {:<10} {:<20} {:<8} PENDING",
        "IDENTIFIER", "VERSION", "STATUS", "ENABLED"
    );
    println!("{}", "─".repeat(88));
    for info in records {
        println!(
            "{:<28} {:<10} {:<20} {:<8} {}",
            info.identifier,
            info.version().unwrap_or("-"),
            info.status.to_string(),
            if info.enabled { "yes" } else { "no" },
            if info.permissions_pending.is_empty() {
                "-".to_string()
            } else {
                info.permissions_pending.join(", ")
            }
        );
        if let Some(error) = &info.error {
            println!("    {error}");
        }
    }
}
