//! The trellis plugin runtime.
//!
//! Hosts construct a [`PluginHost`] (the session-wide services), a
//! [`PluginManager`] over one or more plugin directories, and a
//! [`ShellRegistry`] the activated plugins contribute UI into. The
//! lifecycle is discover, activate, serve; see the crate-level tests
//! for an end-to-end walkthrough.

mod config;
mod context;
mod data;
mod events;
mod host;
mod import;
mod manager;
mod plugin;
mod prompt;

pub use config::{ConfigEntry, PluginConfigStore, PluginSource, SourceKind};
pub use context::{
    BroadcastHandler, ControlBuilder, HostHandlers, NavigationView, OperationHandler, PageHandle,
    PermissionError, PluginContext, PluginPaths, RouteView, SettingsPage, ShellRegistry,
    StartupHook,
};
pub use data::{DataSnapshot, DataStoreError, GlobalDataAccess, GlobalDataStore, NamespaceSummary};
pub use events::{
    EventBus, EventDefinition, EventHandler, PermissionResolver, PluginEvent, Subscription,
};
pub use host::PluginHost;
pub use import::{ImportPolicy, ImportResult, collect_required_modules};
pub use manager::{
    ENTRY_CANDIDATES, LoadedPlugin, ManagerError, PLUGIN_EXTENSION, PluginManager,
};
pub use plugin::{ActivationError, LoadError, Plugin, PluginLoader, StaticPluginLoader};
pub use prompt::{PromptCoordinator, PromptDecision, PromptOutcome, PromptRequest};
