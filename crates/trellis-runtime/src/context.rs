//! The capability surface handed to a plugin at activation.
//!
//! A [`PluginContext`] bundles everything a plugin may touch: shell
//! registries for contributing UI, permission-gated host operations,
//! the event bus, the shared data store and per-plugin filesystem
//! roots. Contexts are cheap to clone and safe to move into handler
//! closures.

use std::any::Any;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use thiserror::Error;

use trellis_core::{ErrorCode, OperationResult, PermissionState, PluginManifest};

use crate::data::{DataSnapshot, DataStoreError, GlobalDataAccess, NamespaceSummary};
use crate::events::{EventDefinition, EventHandler, Subscription};
use crate::host::PluginHost;
use crate::prompt::PromptOutcome;

/// Opaque UI payload produced by a plugin. The shell downcasts these
/// to its own widget type; the runtime never looks inside.
pub type ControlBuilder = Arc<dyn Fn() -> Box<dyn Any + Send> + Send + Sync>;

/// Opaque handle to a plugin's dedicated page in the shell.
pub type PageHandle = Arc<dyn Any + Send + Sync>;

pub type StartupHook = Box<dyn Fn() + Send + Sync>;

/// Handler for a gated host operation: `(plugin_id, argument)`.
pub type OperationHandler = Box<dyn Fn(&str, &str) -> OperationResult + Send + Sync>;

/// Handler for broadcast sends: `(plugin_id, channel, payload)`.
pub type BroadcastHandler =
    Box<dyn Fn(&str, &str, serde_json::Value) -> OperationResult + Send + Sync>;

/// A navigation destination contributed to the shell's main menu.
#[derive(Clone)]
pub struct NavigationView {
    pub id: String,
    pub label: String,
    pub icon: String,
    pub selected_icon: String,
    pub builder: ControlBuilder,
}

/// A routable view contributed to the shell's router.
#[derive(Clone)]
pub struct RouteView {
    pub route: String,
    pub builder: ControlBuilder,
}

/// A page contributed to the host settings dialog.
#[derive(Clone)]
pub struct SettingsPage {
    pub plugin_id: String,
    pub title: String,
    pub builder: ControlBuilder,
    pub icon: Option<String>,
    pub button_label: String,
    pub description: Option<String>,
}

/// Shared registries the shell drains after activation to build its
/// UI. All methods take `&self`; registration order is preserved.
#[derive(Default)]
pub struct ShellRegistry {
    navigation: Mutex<Vec<(String, NavigationView)>>,
    routes: Mutex<IndexMap<String, RouteView>>,
    startup_hooks: Mutex<Vec<StartupHook>>,
    settings_pages: Mutex<Vec<SettingsPage>>,
    primary_actions: Mutex<Vec<(String, ControlBuilder)>>,
    initial_route: Mutex<Option<String>>,
}

impl ShellRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register_navigation(&self, plugin_id: &str, view: NavigationView) {
        Self::guard(&self.navigation).push((plugin_id.to_string(), view));
    }

    /// `(plugin_id, view)` pairs in registration order.
    pub fn navigation_views(&self) -> Vec<(String, NavigationView)> {
        Self::guard(&self.navigation).clone()
    }

    pub fn find_navigation(&self, id: &str) -> Option<NavigationView> {
        Self::guard(&self.navigation)
            .iter()
            .find(|(_, view)| view.id == id)
            .map(|(_, view)| view.clone())
    }

    /// Later registrations of the same route win; the shell warns.
    pub fn register_route(&self, view: RouteView) {
        let mut routes = Self::guard(&self.routes);
        if routes.contains_key(&view.route) {
            tracing::warn!(target: "plugin", "route '{}' re-registered, replacing", view.route);
        }
        routes.insert(view.route.clone(), view);
    }

    pub fn has_route(&self, route: &str) -> bool {
        Self::guard(&self.routes).contains_key(route)
    }

    pub fn routes(&self) -> Vec<RouteView> {
        Self::guard(&self.routes).values().cloned().collect()
    }

    pub fn add_startup_hook(&self, hook: StartupHook) {
        Self::guard(&self.startup_hooks).push(hook);
    }

    /// Runs every startup hook once, in registration order, consuming
    /// them.
    pub fn run_startup_hooks(&self) {
        let hooks: Vec<StartupHook> = {
            let mut guard = Self::guard(&self.startup_hooks);
            guard.drain(..).collect()
        };
        for hook in hooks {
            hook();
        }
    }

    /// A plugin gets at most one settings page; re-registration by
    /// the same plugin replaces its earlier page in place.
    pub fn register_settings_page(&self, page: SettingsPage) {
        let mut pages = Self::guard(&self.settings_pages);
        if let Some(existing) = pages
            .iter_mut()
            .find(|existing| existing.plugin_id == page.plugin_id)
        {
            *existing = page;
        } else {
            pages.push(page);
        }
    }

    pub fn settings_pages(&self) -> Vec<SettingsPage> {
        Self::guard(&self.settings_pages).clone()
    }

    pub fn add_primary_action(&self, plugin_id: &str, builder: ControlBuilder) {
        Self::guard(&self.primary_actions).push((plugin_id.to_string(), builder));
    }

    pub fn primary_actions(&self) -> Vec<(String, ControlBuilder)> {
        Self::guard(&self.primary_actions).clone()
    }

    pub(crate) fn set_initial_route(&self, route: &str) {
        *Self::guard(&self.initial_route) = Some(route.to_string());
    }

    pub fn initial_route(&self) -> Option<String> {
        Self::guard(&self.initial_route).clone()
    }
}

/// Host-side implementations of the gated operations. Slots left
/// `None` make the corresponding operation report
/// `operation_unavailable`, letting headless hosts run plugins that
/// only use the event and data facilities.
#[derive(Default)]
pub struct HostHandlers {
    pub open_route: Option<OperationHandler>,
    pub switch_home: Option<OperationHandler>,
    pub open_settings_tab: Option<OperationHandler>,
    pub primary_action: Option<OperationHandler>,
    pub broadcast_send: Option<BroadcastHandler>,
    pub broadcast_subscribe: Option<OperationHandler>,
    pub broadcast_unsubscribe: Option<OperationHandler>,
}

/// Per-plugin filesystem roots. Directories are created lazily.
#[derive(Debug, Clone)]
pub struct PluginPaths {
    pub data_root: PathBuf,
    pub config_root: PathBuf,
    pub cache_root: PathBuf,
}

impl PluginPaths {
    pub fn under(root: &Path) -> Self {
        Self {
            data_root: root.join("data"),
            config_root: root.join("config"),
            cache_root: root.join("cache"),
        }
    }

    fn resolve(root: &Path, plugin_id: &str, parts: &[&str], create: bool) -> io::Result<PathBuf> {
        let mut path = root.join(plugin_id);
        for part in parts {
            path.push(part);
        }
        if create {
            let dir = if parts.is_empty() {
                path.as_path()
            } else {
                path.parent().unwrap_or(path.as_path())
            };
            fs::create_dir_all(dir)?;
        }
        Ok(path)
    }
}

/// Raised by [`PluginContext::ensure_permission`] when the capability
/// is denied or the prompt is dismissed.
#[derive(Debug, Error)]
#[error("permission '{permission}' is not granted")]
pub struct PermissionError {
    pub permission: String,
}

struct ContextInner {
    manifest: PluginManifest,
    builtin: bool,
    page: Option<PageHandle>,
    shell: Arc<ShellRegistry>,
    handlers: Arc<HostHandlers>,
    host: PluginHost,
    data: GlobalDataAccess,
    paths: PluginPaths,
}

/// The capability surface for one activated plugin.
#[derive(Clone)]
pub struct PluginContext {
    inner: Arc<ContextInner>,
}

impl PluginContext {
    pub fn new(
        host: &PluginHost,
        manifest: PluginManifest,
        builtin: bool,
        shell: Arc<ShellRegistry>,
        handlers: Arc<HostHandlers>,
        paths: PluginPaths,
        page: Option<PageHandle>,
    ) -> Self {
        let data = GlobalDataAccess::new(manifest.identifier.clone(), host.data.clone());
        Self {
            inner: Arc::new(ContextInner {
                manifest,
                builtin,
                page,
                shell,
                handlers,
                host: host.clone(),
                data,
                paths,
            }),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.inner.manifest.identifier
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.inner.manifest
    }

    pub fn is_builtin(&self) -> bool {
        self.inner.builtin
    }

    /// The plugin's dedicated page handle, when the shell gave it one.
    pub fn page(&self) -> Option<&PageHandle> {
        self.inner.page.as_ref()
    }

    // ---- permissions -------------------------------------------------

    /// Live read of the persisted decision; `Prompt` never blocks here.
    pub fn permission_state(&self, permission: &str) -> PermissionState {
        self.inner
            .host
            .config
            .permission_state(self.plugin_id(), permission)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permission_state(permission).is_granted()
    }

    /// Resolves a permission, prompting the user if it is undecided.
    /// Blocks the calling thread while the prompt is pending. A
    /// dismissed prompt leaves the state at `Prompt`.
    pub fn request_permission(
        &self,
        permission: &str,
        message: Option<String>,
    ) -> PermissionState {
        match self.permission_state(permission) {
            PermissionState::Prompt => {
                match self
                    .inner
                    .host
                    .prompts
                    .request(self.plugin_id(), permission, message)
                {
                    PromptOutcome::Granted => PermissionState::Granted,
                    PromptOutcome::Denied => PermissionState::Denied,
                    PromptOutcome::Cancelled(_) => PermissionState::Prompt,
                }
            }
            decided => decided,
        }
    }

    /// Like [`request_permission`](Self::request_permission) but
    /// returns an error unless the outcome is a grant.
    pub fn ensure_permission(
        &self,
        permission: &str,
        message: Option<String>,
    ) -> Result<(), PermissionError> {
        match self.request_permission(permission, message) {
            PermissionState::Granted => Ok(()),
            _ => Err(PermissionError {
                permission: permission.to_string(),
            }),
        }
    }

    /// Runs `op` iff `permission` resolves to a grant, prompting when
    /// undecided.
    fn guarded<F>(&self, permission: &str, op: F) -> OperationResult
    where
        F: FnOnce() -> OperationResult,
    {
        match self.permission_state(permission) {
            PermissionState::Granted => op(),
            PermissionState::Denied => OperationResult::denied(permission),
            PermissionState::Prompt => {
                match self
                    .inner
                    .host
                    .prompts
                    .request(self.plugin_id(), permission, None)
                {
                    PromptOutcome::Granted => op(),
                    PromptOutcome::Denied => OperationResult::denied(permission),
                    PromptOutcome::Cancelled(reason) => OperationResult::cancelled(reason),
                }
            }
        }
    }

    // ---- gated host operations --------------------------------------

    pub fn open_route(&self, route: &str) -> OperationResult {
        if route.trim().is_empty() {
            return OperationResult::invalid("route must not be empty");
        }
        let Some(handler) = self.inner.handlers.open_route.as_ref() else {
            return OperationResult::failed(
                ErrorCode::OperationUnavailable,
                "host does not expose route navigation",
            );
        };
        self.guarded("app_route", || handler(self.plugin_id(), route))
    }

    pub fn switch_home(&self, navigation_id: &str) -> OperationResult {
        if navigation_id.trim().is_empty() {
            return OperationResult::invalid("navigation id must not be empty");
        }
        let Some(handler) = self.inner.handlers.switch_home.as_ref() else {
            return OperationResult::failed(
                ErrorCode::OperationUnavailable,
                "host does not expose home view switching",
            );
        };
        self.guarded("app_home", || handler(self.plugin_id(), navigation_id))
    }

    pub fn open_settings_tab(&self, tab: &str) -> OperationResult {
        if tab.trim().is_empty() {
            return OperationResult::invalid("settings tab must not be empty");
        }
        let Some(handler) = self.inner.handlers.open_settings_tab.as_ref() else {
            return OperationResult::failed(
                ErrorCode::SettingsUnavailable,
                "host settings are unavailable",
            );
        };
        self.guarded("app_settings", || handler(self.plugin_id(), tab))
    }

    pub fn invoke_primary_action(&self, argument: &str) -> OperationResult {
        if argument.trim().is_empty() {
            return OperationResult::invalid("argument must not be empty");
        }
        let Some(handler) = self.inner.handlers.primary_action.as_ref() else {
            return OperationResult::failed(
                ErrorCode::OperationUnavailable,
                "host does not expose a primary action",
            );
        };
        self.guarded("primary_action", || handler(self.plugin_id(), argument))
    }

    pub fn broadcast(&self, channel: &str, payload: serde_json::Value) -> OperationResult {
        if channel.trim().is_empty() {
            return OperationResult::invalid("channel must not be empty");
        }
        let Some(handler) = self.inner.handlers.broadcast_send.as_ref() else {
            return OperationResult::failed(
                ErrorCode::OperationUnavailable,
                "host does not expose broadcasting",
            );
        };
        self.guarded("broadcast", || handler(self.plugin_id(), channel, payload))
    }

    /// On success the result's `data` carries the subscription id the
    /// host assigned.
    pub fn subscribe_broadcast(&self, channel: &str) -> OperationResult {
        if channel.trim().is_empty() {
            return OperationResult::invalid("channel must not be empty");
        }
        let Some(handler) = self.inner.handlers.broadcast_subscribe.as_ref() else {
            return OperationResult::failed(
                ErrorCode::OperationUnavailable,
                "host does not expose broadcasting",
            );
        };
        self.guarded("broadcast", || handler(self.plugin_id(), channel))
    }

    pub fn unsubscribe_broadcast(&self, subscription_id: &str) -> OperationResult {
        if subscription_id.trim().is_empty() {
            return OperationResult::invalid("subscription id must not be empty");
        }
        let Some(handler) = self.inner.handlers.broadcast_unsubscribe.as_ref() else {
            return OperationResult::failed(
                ErrorCode::OperationUnavailable,
                "host does not expose broadcasting",
            );
        };
        self.guarded("broadcast", || handler(self.plugin_id(), subscription_id))
    }

    // ---- events ------------------------------------------------------

    pub fn register_event(
        &self,
        event_type: &str,
        description: &str,
        permission: Option<String>,
    ) {
        self.inner
            .host
            .events
            .register_event(self.plugin_id(), event_type, description, permission, false);
    }

    pub fn subscribe_event(
        &self,
        event_type: &str,
        handler: EventHandler,
        replay_last: bool,
    ) -> Subscription {
        self.inner
            .host
            .events
            .subscribe(self.plugin_id(), event_type, handler, replay_last)
    }

    pub fn unsubscribe_event(&self, subscription: &Subscription) -> bool {
        self.inner.host.events.unsubscribe(subscription)
    }

    pub fn emit_event(&self, event_type: &str, payload: serde_json::Value) {
        self.inner.host.events.emit(self.plugin_id(), event_type, payload);
    }

    pub fn event_definitions(&self) -> Vec<EventDefinition> {
        self.inner.host.events.definitions()
    }

    // ---- shared data -------------------------------------------------

    pub fn register_data_namespace(
        &self,
        identifier: &str,
        description: &str,
        permission: Option<String>,
        overwrite: bool,
    ) -> Result<(), DataStoreError> {
        self.inner
            .data
            .register_namespace(identifier, description, permission, overwrite)
    }

    pub fn publish_data(
        &self,
        namespace: &str,
        entry_id: &str,
        payload: serde_json::Value,
    ) -> Result<DataSnapshot, DataStoreError> {
        self.inner.data.publish(namespace, entry_id, payload)
    }

    pub fn get_data(&self, namespace: &str, entry_id: &str) -> Option<DataSnapshot> {
        self.inner.data.get(namespace, entry_id)
    }

    pub fn latest_data(&self, namespace: &str) -> Option<DataSnapshot> {
        self.inner.data.latest(namespace)
    }

    pub fn list_data(&self, namespace: &str) -> Vec<DataSnapshot> {
        self.inner.data.list(namespace)
    }

    pub fn data_namespaces(&self) -> Vec<NamespaceSummary> {
        self.inner.data.namespaces()
    }

    // ---- shell contributions ----------------------------------------

    pub fn add_navigation_view(&self, view: NavigationView) {
        self.inner.shell.register_navigation(self.plugin_id(), view);
    }

    pub fn add_route_view(&self, view: RouteView) {
        self.inner.shell.register_route(view);
    }

    pub fn add_startup_hook(&self, hook: StartupHook) {
        self.inner.shell.add_startup_hook(hook);
    }

    pub fn register_settings_page(
        &self,
        title: &str,
        builder: ControlBuilder,
        icon: Option<String>,
        button_label: Option<String>,
        description: Option<String>,
    ) {
        self.inner.shell.register_settings_page(SettingsPage {
            plugin_id: self.plugin_id().to_string(),
            title: title.to_string(),
            builder,
            icon,
            button_label: button_label.unwrap_or_else(|| "Open".to_string()),
            description,
        });
    }

    pub fn add_primary_action(&self, builder: ControlBuilder) {
        self.inner.shell.add_primary_action(self.plugin_id(), builder);
    }

    /// Only builtin plugins may steer where the shell starts;
    /// third-party attempts are logged and ignored.
    pub fn set_initial_route(&self, route: &str) {
        if !self.inner.builtin {
            tracing::warn!(
                target: "plugin",
                "'{}' is not builtin and may not set the initial route",
                self.plugin_id()
            );
            return;
        }
        self.inner.shell.set_initial_route(route);
    }

    // ---- filesystem --------------------------------------------------

    pub fn data_path(&self, parts: &[&str], create: bool) -> io::Result<PathBuf> {
        PluginPaths::resolve(&self.inner.paths.data_root, self.plugin_id(), parts, create)
    }

    pub fn config_path(&self, parts: &[&str], create: bool) -> io::Result<PathBuf> {
        PluginPaths::resolve(
            &self.inner.paths.config_root,
            self.plugin_id(),
            parts,
            create,
        )
    }

    pub fn cache_path(&self, parts: &[&str], create: bool) -> io::Result<PathBuf> {
        PluginPaths::resolve(
            &self.inner.paths.cache_root,
            self.plugin_id(),
            parts,
            create,
        )
    }
}
