use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use trellis_core::{
    PermissionState, PluginManifest, PluginStatus,
};
use trellis_runtime::{
    ActivationError, DataStoreError, GlobalDataAccess, HostHandlers, Plugin, PluginConfigStore,
    PluginContext, PluginHost, PluginManager, PluginPaths, PromptDecision, PromptOutcome,
    ShellRegistry, StaticPluginLoader,
};

type ActivateFn = dyn Fn(&PluginContext) -> Result<(), ActivationError> + Send + Sync;

struct TestPlugin {
    manifest: PluginManifest,
    on_activate: Arc<ActivateFn>,
}

impl Plugin for TestPlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn activate(&self, context: &PluginContext) -> Result<(), ActivationError> {
        (self.on_activate)(context)
    }
}

fn noop() -> Arc<ActivateFn> {
    Arc::new(|_context| Ok(()))
}

struct Fixture {
    temp: TempDir,
    plugins_dir: PathBuf,
    loader: StaticPluginLoader,
    builtins: HashSet<String>,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let plugins_dir = temp.path().join("plugins");
        fs::create_dir_all(&plugins_dir).unwrap();
        Self {
            temp,
            plugins_dir,
            loader: StaticPluginLoader::new(),
            builtins: HashSet::new(),
        }
    }

    fn config_path(&self) -> PathBuf {
        self.temp.path().join("config").join("plugins.json")
    }

    /// Installs a module marker and registers its factory.
    fn add_plugin(&mut self, module: &str, manifest: PluginManifest, on_activate: Arc<ActivateFn>) {
        fs::write(
            self.plugins_dir.join(format!("{module}.lua")),
            "-- native module marker\n",
        )
        .unwrap();
        self.loader.register(module, move || {
            Box::new(TestPlugin {
                manifest: manifest.clone(),
                on_activate: on_activate.clone(),
            })
        });
    }

    fn manager(self) -> (PluginManager, TempDir) {
        let config = Arc::new(PluginConfigStore::new(self.config_path()));
        let host = PluginHost::new(config);
        let manager = PluginManager::new(
            vec![self.plugins_dir],
            Box::new(self.loader),
            host,
            self.builtins,
        );
        (manager, self.temp)
    }
}

fn manifest(identifier: &str, version: &str) -> PluginManifest {
    PluginManifest::new(identifier, identifier, version)
}

fn activate_everything(manager: &mut PluginManager, root: &Path) -> Arc<ShellRegistry> {
    let host = manager.host().clone();
    let shell = Arc::new(ShellRegistry::new());
    let handlers = Arc::new(HostHandlers::default());
    let paths = PluginPaths::under(root);
    let shell_for_factory = shell.clone();
    manager.activate_all(move |loaded| {
        Ok(PluginContext::new(
            &host,
            loaded.manifest.clone(),
            loaded.builtin,
            shell_for_factory.clone(),
            handlers.clone(),
            paths.clone(),
            None,
        ))
    });
    shell
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached in time");
}

// ---- discovery and configuration -------------------------------------

#[test]
fn test_discovery_builds_records_and_persists_defaults() {
    let mut fixture = Fixture::new();
    fixture.add_plugin(
        "alpha",
        manifest("demo.alpha", "1.0.0").with_permission("app_route"),
        noop(),
    );
    let (mut manager, _temp) = fixture.manager();
    manager.discover();

    let info = manager.get("demo.alpha").unwrap();
    assert_eq!(info.status, PluginStatus::Loaded);
    assert!(info.enabled);
    assert_eq!(
        info.permission_states["app_route"],
        PermissionState::Prompt
    );
    assert_eq!(info.permissions_pending, vec!["app_route".to_string()]);
    assert_eq!(manager.loaded_plugins().len(), 1);
}

#[test]
fn test_discovery_merges_without_overwriting_decisions() {
    let mut fixture = Fixture::new();
    fixture.add_plugin(
        "alpha",
        manifest("demo.alpha", "1.0.0").with_permission("app_route"),
        noop(),
    );
    let config_path = fixture.config_path();
    {
        let config = PluginConfigStore::new(&config_path);
        config.set_permission_state("demo.alpha", "app_route", PermissionState::Denied);
        config.set_enabled("demo.alpha", false);
    }
    let (mut manager, _temp) = fixture.manager();
    manager.discover();

    let info = manager.get("demo.alpha").unwrap();
    assert_eq!(info.status, PluginStatus::Disabled);
    assert!(!info.enabled);
    assert_eq!(info.permission_states["app_route"], PermissionState::Denied);
    assert!(manager.loaded_plugins().is_empty());

    // A second pass is idempotent.
    manager.discover();
    let info = manager.get("demo.alpha").unwrap();
    assert_eq!(info.permission_states["app_route"], PermissionState::Denied);
}

#[test]
fn test_unloadable_module_becomes_failed_record() {
    let fixture = {
        let mut f = Fixture::new();
        // Marker file without a registered factory.
        fs::write(f.plugins_dir.join("ghost.lua"), "-- marker\n").unwrap();
        f.add_plugin("alpha", manifest("demo.alpha", "1.0.0"), noop());
        f
    };
    let (mut manager, _temp) = fixture.manager();
    manager.discover();

    let ghost = manager.get("ghost").unwrap();
    assert_eq!(ghost.status, PluginStatus::Failed);
    assert!(ghost.error.as_deref().unwrap().contains("not registered"));
    // The healthy plugin is unaffected.
    assert_eq!(
        manager.get("demo.alpha").unwrap().status,
        PluginStatus::Loaded
    );
}

#[test]
fn test_missing_files_flagged_from_config() {
    let mut fixture = Fixture::new();
    fixture.add_plugin("alpha", manifest("demo.alpha", "1.0.0"), noop());
    let config_path = fixture.config_path();
    {
        let config = PluginConfigStore::new(&config_path);
        config.set_enabled("demo.vanished", true);
    }
    let (mut manager, _temp) = fixture.manager();
    manager.discover();

    let gone = manager.get("demo.vanished").unwrap();
    assert_eq!(gone.status, PluginStatus::Failed);
    assert!(gone.error.as_deref().unwrap().contains("missing"));
}

#[test]
fn test_malformed_dependency_fails_record() {
    let mut fixture = Fixture::new();
    fixture.add_plugin(
        "alpha",
        manifest("demo.alpha", "1.0.0").with_dependency("other ~> 1.0"),
        noop(),
    );
    let (mut manager, _temp) = fixture.manager();
    manager.discover();

    let info = manager.get("demo.alpha").unwrap();
    assert_eq!(info.status, PluginStatus::Failed);
}

#[test]
fn test_broken_module_cannot_clobber_existing_identifier() {
    let mut fixture = Fixture::new();
    fixture.add_plugin("alpha", manifest("demo.alpha", "1.0.0"), noop());
    // Marker whose stem collides with the identifier above, with no
    // factory behind it.
    fs::write(fixture.plugins_dir.join("demo.alpha.lua"), "-- marker\n").unwrap();
    let (mut manager, _temp) = fixture.manager();
    manager.discover();

    let info = manager.get("demo.alpha").unwrap();
    assert_eq!(info.status, PluginStatus::Loaded);
    assert_eq!(info.module_name.as_deref(), Some("alpha"));
    assert_eq!(manager.loaded_plugins().len(), 1);
}

#[test]
fn test_pending_changes_track_persisted_flags() {
    let mut fixture = Fixture::new();
    fixture.add_plugin("alpha", manifest("demo.alpha", "1.0.0"), noop());
    let config_path = fixture.config_path();
    {
        let config = PluginConfigStore::new(&config_path);
        // Enabled entry whose files vanished; a restart changes
        // nothing for it.
        config.set_enabled("demo.vanished", true);
    }
    let (mut manager, _temp) = fixture.manager();
    manager.discover();
    assert!(!manager.has_pending_changes());

    manager.set_enabled("demo.alpha", false);
    assert!(manager.has_pending_changes());

    // The next discovery pass applies the flag; nothing pending again.
    manager.discover();
    assert_eq!(
        manager.get("demo.alpha").unwrap().status,
        PluginStatus::Disabled
    );
    assert!(!manager.has_pending_changes());
}

// ---- dependencies and activation order --------------------------------

#[test]
fn test_unsatisfied_version_constraint_demotes_dependent() {
    let mut fixture = Fixture::new();
    fixture.add_plugin("a", manifest("a", "1.1.0"), noop());
    fixture.add_plugin(
        "b",
        manifest("b", "1.0.0").with_dependency("a >= 1.2.0"),
        noop(),
    );
    let (mut manager, _temp) = fixture.manager();
    manager.discover();

    let b = manager.get("b").unwrap();
    assert_eq!(b.status, PluginStatus::MissingDependency);
    assert!(b.dependency_issues.contains_key("a"));
    assert!(b.error.as_deref().unwrap().contains("a >= 1.2.0"));
    // Only 'a' remains loadable.
    let loadable: Vec<&str> = manager
        .loaded_plugins()
        .iter()
        .map(|p| p.identifier.as_str())
        .collect();
    assert_eq!(loadable, vec!["a"]);
}

#[test]
fn test_disabled_dependency_counts_as_missing() {
    let mut fixture = Fixture::new();
    fixture.add_plugin("a", manifest("a", "2.0.0"), noop());
    fixture.add_plugin("b", manifest("b", "1.0.0").with_dependency("a"), noop());
    let config_path = fixture.config_path();
    {
        let config = PluginConfigStore::new(&config_path);
        config.set_enabled("a", false);
    }
    let (mut manager, _temp) = fixture.manager();
    manager.discover();

    let b = manager.get("b").unwrap();
    assert_eq!(b.status, PluginStatus::MissingDependency);
    assert!(b.error.as_deref().unwrap().contains("not enabled"));
}

#[test]
fn test_activation_order_dependencies_first() {
    let mut fixture = Fixture::new();
    // File names put the dependent first in discovery order.
    fixture.add_plugin(
        "m1",
        manifest("top", "1.0").with_dependency("mid"),
        noop(),
    );
    fixture.add_plugin(
        "m2",
        manifest("mid", "1.0").with_dependency("base"),
        noop(),
    );
    fixture.add_plugin("m3", manifest("base", "1.0"), noop());
    let (mut manager, _temp) = fixture.manager();
    manager.discover();

    let order = manager.activation_order();
    let position = |id: &str| order.iter().position(|x| x == id).unwrap();
    assert!(position("base") < position("mid"));
    assert!(position("mid") < position("top"));
}

#[test]
fn test_dependency_cycle_falls_back_to_discovery_order() {
    let mut fixture = Fixture::new();
    fixture.add_plugin("m1", manifest("a", "1.0").with_dependency("b"), noop());
    fixture.add_plugin("m2", manifest("b", "1.0").with_dependency("c"), noop());
    fixture.add_plugin("m3", manifest("c", "1.0").with_dependency("a"), noop());
    let (mut manager, _temp) = fixture.manager();
    manager.discover();

    let discovery: Vec<String> = manager
        .loaded_plugins()
        .iter()
        .map(|p| p.identifier.clone())
        .collect();
    assert_eq!(manager.activation_order(), discovery);
}

#[test]
fn test_activation_failures_are_isolated() {
    let mut fixture = Fixture::new();
    fixture.add_plugin(
        "bad",
        manifest("demo.bad", "1.0"),
        Arc::new(|_| Err("activation exploded".into())),
    );
    fixture.add_plugin(
        "panicky",
        manifest("demo.panicky", "1.0"),
        Arc::new(|_| panic!("boom")),
    );
    fixture.add_plugin("solid", manifest("demo.solid", "1.0"), noop());
    let (mut manager, temp) = fixture.manager();
    manager.discover();
    let root = temp.path().to_path_buf();
    activate_everything(&mut manager, &root);

    assert_eq!(manager.get("demo.bad").unwrap().status, PluginStatus::Error);
    assert!(
        manager
            .get("demo.bad")
            .unwrap()
            .error
            .as_deref()
            .unwrap()
            .contains("exploded")
    );
    assert_eq!(
        manager.get("demo.panicky").unwrap().status,
        PluginStatus::Error
    );
    assert_eq!(
        manager.get("demo.solid").unwrap().status,
        PluginStatus::Active
    );
}

#[test]
fn test_plugins_contribute_shell_surface() {
    let mut fixture = Fixture::new();
    fixture.add_plugin(
        "ui",
        manifest("demo.ui", "1.0"),
        Arc::new(|context| {
            context.add_route_view(trellis_runtime::RouteView {
                route: "/demo".to_string(),
                builder: Arc::new(|| Box::new(()) as Box<dyn std::any::Any + Send>),
            });
            context.register_settings_page(
                "Demo settings",
                Arc::new(|| Box::new(()) as Box<dyn std::any::Any + Send>),
                None,
                None,
                None,
            );
            // Replaces the page above, not appends.
            context.register_settings_page(
                "Demo settings v2",
                Arc::new(|| Box::new(()) as Box<dyn std::any::Any + Send>),
                None,
                None,
                None,
            );
            // Not builtin, so this is ignored.
            context.set_initial_route("/demo");
            Ok(())
        }),
    );
    let (mut manager, temp) = fixture.manager();
    manager.discover();
    let root = temp.path().to_path_buf();
    let shell = activate_everything(&mut manager, &root);

    assert!(shell.has_route("/demo"));
    let pages = shell.settings_pages();
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].title, "Demo settings v2");
    assert_eq!(shell.initial_route(), None);
}

// ---- events -----------------------------------------------------------

#[test]
fn test_replay_last_delivers_exactly_once() {
    let config = Arc::new(PluginConfigStore::new(
        TempDir::new().unwrap().path().join("c.json"),
    ));
    let host = PluginHost::new(config);
    host.events
        .register_event("owner", "tick", "Periodic tick", None, false);
    host.events.emit("owner", "tick", serde_json::json!({"n": 1}));
    host.events.emit("owner", "tick", serde_json::json!({"n": 2}));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    host.events.subscribe(
        "listener",
        "tick",
        Arc::new(move |event| sink.lock().unwrap().push(event.payload.clone())),
        true,
    );
    // Only the latest retained event is replayed, exactly once.
    assert_eq!(*seen.lock().unwrap(), vec![serde_json::json!({"n": 2})]);

    let silent = Arc::new(Mutex::new(Vec::new()));
    let sink = silent.clone();
    host.events.subscribe(
        "listener2",
        "tick",
        Arc::new(move |event| sink.lock().unwrap().push(event.payload.clone())),
        false,
    );
    assert!(silent.lock().unwrap().is_empty());
}

#[test]
fn test_event_permission_gating_tracks_config() {
    let temp = TempDir::new().unwrap();
    let config = Arc::new(PluginConfigStore::new(temp.path().join("c.json")));
    let host = PluginHost::new(config.clone());
    host.events.register_event(
        "owner",
        "secure",
        "Gated event",
        Some("app_route".to_string()),
        false,
    );

    let seen = Arc::new(Mutex::new(0usize));
    let sink = seen.clone();
    host.events.subscribe(
        "reader",
        "secure",
        Arc::new(move |_| *sink.lock().unwrap() += 1),
        false,
    );

    host.events.emit("owner", "secure", serde_json::json!({}));
    assert_eq!(*seen.lock().unwrap(), 0);

    config.set_permission_state("reader", "app_route", PermissionState::Granted);
    host.events.emit("owner", "secure", serde_json::json!({}));
    assert_eq!(*seen.lock().unwrap(), 1);
}

#[test]
fn test_listener_panic_does_not_break_delivery() {
    let config = Arc::new(PluginConfigStore::new(
        TempDir::new().unwrap().path().join("c.json"),
    ));
    let host = PluginHost::new(config);
    host.events
        .register_event("owner", "tick", "Periodic tick", None, false);

    host.events.subscribe(
        "noisy",
        "tick",
        Arc::new(|_| panic!("listener bug")),
        false,
    );
    let seen = Arc::new(Mutex::new(0usize));
    let sink = seen.clone();
    host.events.subscribe(
        "quiet",
        "tick",
        Arc::new(move |_| *sink.lock().unwrap() += 1),
        false,
    );

    host.events.emit("owner", "tick", serde_json::json!({}));
    assert_eq!(*seen.lock().unwrap(), 1);
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let config = Arc::new(PluginConfigStore::new(
        TempDir::new().unwrap().path().join("c.json"),
    ));
    let host = PluginHost::new(config);
    host.events
        .register_event("owner", "tick", "Periodic tick", None, false);

    let seen = Arc::new(Mutex::new(0usize));
    let sink = seen.clone();
    let subscription = host.events.subscribe(
        "listener",
        "tick",
        Arc::new(move |_| *sink.lock().unwrap() += 1),
        false,
    );
    host.events.emit("owner", "tick", serde_json::json!({}));
    assert!(host.events.unsubscribe(&subscription));
    host.events.emit("owner", "tick", serde_json::json!({}));
    assert_eq!(*seen.lock().unwrap(), 1);
    assert!(!host.events.unsubscribe(&subscription));
}

// ---- shared data ------------------------------------------------------

#[test]
fn test_data_revisions_and_timestamps() {
    let config = Arc::new(PluginConfigStore::new(
        TempDir::new().unwrap().path().join("c.json"),
    ));
    let host = PluginHost::new(config);
    let owner = GlobalDataAccess::new("owner", host.data.clone());
    owner
        .register_namespace("weather", "Weather reports", None, false)
        .unwrap();

    let first = owner
        .publish("weather", "today", serde_json::json!({"temp": 21}))
        .unwrap();
    assert_eq!(first.revision, 1);

    let second = owner
        .publish("weather", "today", serde_json::json!({"temp": 24}))
        .unwrap();
    assert_eq!(second.revision, 2);
    assert_eq!(second.created_at, first.created_at);
    assert!(second.updated_at >= first.updated_at);
    assert_eq!(second.payload, serde_json::json!({"temp": 24}));
}

#[test]
fn test_non_owner_publish_is_rejected() {
    let config = Arc::new(PluginConfigStore::new(
        TempDir::new().unwrap().path().join("c.json"),
    ));
    let host = PluginHost::new(config);
    let owner = GlobalDataAccess::new("owner", host.data.clone());
    owner
        .register_namespace("weather", "Weather reports", None, false)
        .unwrap();

    let intruder = GlobalDataAccess::new("intruder", host.data.clone());
    let error = intruder
        .publish("weather", "today", serde_json::json!({}))
        .unwrap_err();
    assert!(matches!(error, DataStoreError::NamespaceOwnership { .. }));

    // Claiming the namespace without overwrite also fails.
    let error = intruder
        .register_namespace("weather", "Mine now", None, false)
        .unwrap_err();
    assert!(matches!(error, DataStoreError::NamespaceOwnership { .. }));
}

#[test]
fn test_gated_reads_degrade_gracefully_at_facade() {
    let temp = TempDir::new().unwrap();
    let config = Arc::new(PluginConfigStore::new(temp.path().join("c.json")));
    let host = PluginHost::new(config.clone());
    let owner = GlobalDataAccess::new("owner", host.data.clone());
    owner
        .register_namespace(
            "private",
            "Gated namespace",
            Some("global_data.read".to_string()),
            false,
        )
        .unwrap();
    owner
        .publish("private", "entry", serde_json::json!({"v": 1}))
        .unwrap();

    let reader = GlobalDataAccess::new("reader", host.data.clone());
    assert!(reader.get("private", "entry").is_none());
    assert!(reader.latest("private").is_none());
    assert!(reader.list("private").is_empty());
    // Missing namespaces degrade the same way.
    assert!(reader.get("no-such", "entry").is_none());
    // The owner always reads its own namespace.
    assert!(owner.get("private", "entry").is_some());

    config.set_permission_state("reader", "global_data.read", PermissionState::Granted);
    assert_eq!(
        reader.latest("private").unwrap().payload,
        serde_json::json!({"v": 1})
    );
}

#[test]
fn test_namespace_listing_respects_read_permission() {
    let temp = TempDir::new().unwrap();
    let config = Arc::new(PluginConfigStore::new(temp.path().join("c.json")));
    let host = PluginHost::new(config.clone());
    let owner = GlobalDataAccess::new("owner", host.data.clone());
    owner
        .register_namespace(
            "private",
            "Gated namespace",
            Some("global_data.read".to_string()),
            false,
        )
        .unwrap();
    owner
        .register_namespace("public", "Open namespace", None, false)
        .unwrap();

    // An unpermissioned reader only sees the ungated namespace.
    let reader = GlobalDataAccess::new("reader", host.data.clone());
    let visible: Vec<String> = reader
        .namespaces()
        .iter()
        .map(|summary| summary.identifier.clone())
        .collect();
    assert_eq!(visible, vec!["public".to_string()]);

    // Owners always see their own; the host directory stays complete.
    assert_eq!(owner.namespaces().len(), 2);
    assert_eq!(host.data.list_namespaces().len(), 2);

    config.set_permission_state("reader", "global_data.read", PermissionState::Granted);
    assert_eq!(reader.namespaces().len(), 2);
}

#[test]
fn test_ownership_transfer_drops_entries() {
    let config = Arc::new(PluginConfigStore::new(
        TempDir::new().unwrap().path().join("c.json"),
    ));
    let host = PluginHost::new(config);
    let owner = GlobalDataAccess::new("owner", host.data.clone());
    owner
        .register_namespace("shared", "Shared scratch", None, false)
        .unwrap();
    owner.publish("shared", "a", serde_json::json!(1)).unwrap();
    owner.publish("shared", "b", serde_json::json!(2)).unwrap();

    // Same-owner re-registration refreshes metadata and keeps entries.
    owner
        .register_namespace("shared", "Updated description", None, false)
        .unwrap();
    assert_eq!(owner.list("shared").len(), 2);

    // A forced transfer starts the namespace fresh.
    let taker = GlobalDataAccess::new("taker", host.data.clone());
    taker
        .register_namespace("shared", "Mine now", None, true)
        .unwrap();
    assert!(taker.list("shared").is_empty());
    assert!(taker.latest("shared").is_none());
    let summary = &host.data.list_namespaces()[0];
    assert_eq!(summary.owner, "taker");
    assert_eq!(summary.entry_count, 0);

    // The previous owner lost its write access along with the data.
    let error = owner
        .publish("shared", "a", serde_json::json!(3))
        .unwrap_err();
    assert!(matches!(error, DataStoreError::NamespaceOwnership { .. }));
}

// ---- prompts ----------------------------------------------------------

#[test]
fn test_prompt_queue_fifo_and_forced_drain() {
    let temp = TempDir::new().unwrap();
    let config = Arc::new(PluginConfigStore::new(temp.path().join("c.json")));
    let host = PluginHost::new(config.clone());
    let prompts = host.prompts.clone();

    let (tx, rx) = mpsc::channel();
    let mut workers = Vec::new();
    for index in 1..=3 {
        let prompts = prompts.clone();
        let tx = tx.clone();
        workers.push(std::thread::spawn(move || {
            let permission = format!("perm{index}");
            let outcome = prompts.request("demo", &permission, None);
            tx.send((permission, outcome)).unwrap();
        }));
        // Enqueue deterministically, one at a time.
        let prompts = host.prompts.clone();
        wait_until(move || {
            prompts.active().is_some() && prompts.queued_len() == index - 1
        });
    }

    // One prompt presented at a time, FIFO.
    assert_eq!(prompts.active().unwrap().permission, "perm1");
    assert!(prompts.resolve_active(PromptDecision::Granted));
    let (permission, outcome) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(permission, "perm1");
    assert_eq!(outcome, PromptOutcome::Granted);
    assert_eq!(
        config.permission_state("demo", "perm1"),
        PermissionState::Granted
    );

    // The next prompt was promoted; drain everything else.
    assert_eq!(prompts.active().unwrap().permission, "perm2");
    prompts.cancel_all("session teardown");
    for _ in 0..2 {
        let (_, outcome) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome, PromptOutcome::Cancelled(_)));
    }
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(prompts.active().is_none());
    // Cancelled prompts persist no decision.
    assert_eq!(
        config.permission_state("demo", "perm2"),
        PermissionState::Prompt
    );
}

#[test]
fn test_later_decision_denies_without_persisting() {
    let temp = TempDir::new().unwrap();
    let config = Arc::new(PluginConfigStore::new(temp.path().join("c.json")));
    let host = PluginHost::new(config.clone());
    let prompts = host.prompts.clone();

    let worker = {
        let prompts = prompts.clone();
        std::thread::spawn(move || prompts.request("demo", "app_route", None))
    };
    {
        let prompts = prompts.clone();
        wait_until(move || prompts.active().is_some());
    }
    assert!(prompts.resolve_active(PromptDecision::Later));
    assert_eq!(worker.join().unwrap(), PromptOutcome::Denied);
    assert_eq!(
        config.permission_state("demo", "app_route"),
        PermissionState::Prompt
    );
}

#[test]
fn test_guarded_operation_prompts_then_runs() {
    let temp = TempDir::new().unwrap();
    let config = Arc::new(PluginConfigStore::new(temp.path().join("c.json")));
    let host = PluginHost::new(config.clone());

    let shell = Arc::new(ShellRegistry::new());
    shell.register_route(trellis_runtime::RouteView {
        route: "/home".to_string(),
        builder: Arc::new(|| Box::new(()) as Box<dyn std::any::Any + Send>),
    });
    let handlers = {
        let shell = shell.clone();
        let mut handlers = HostHandlers::default();
        handlers.open_route = Some(Box::new(move |_plugin, route| {
            if shell.has_route(route) {
                trellis_core::OperationResult::ok()
            } else {
                trellis_core::OperationResult::failed(
                    trellis_core::ErrorCode::RouteNotFound,
                    format!("no view registered for '{route}'"),
                )
            }
        }));
        Arc::new(handlers)
    };

    let context = PluginContext::new(
        &host,
        manifest("demo.nav", "1.0").with_permission("app_route"),
        false,
        shell,
        handlers,
        PluginPaths::under(temp.path()),
        None,
    );

    // Denied short-circuits without calling the handler.
    config.set_permission_state("demo.nav", "app_route", PermissionState::Denied);
    let result = context.open_route("/home");
    assert_eq!(result.error, Some(trellis_core::ErrorCode::PermissionDenied));

    // Reset to undecided; the call blocks on a prompt until granted.
    config.set_permission_state("demo.nav", "app_route", PermissionState::Prompt);
    let worker = {
        let context = context.clone();
        std::thread::spawn(move || context.open_route("/home"))
    };
    {
        let prompts = host.prompts.clone();
        wait_until(move || prompts.active().is_some());
    }
    assert_eq!(host.prompts.active().unwrap().permission, "app_route");
    host.prompts.resolve_active(PromptDecision::Granted);
    assert!(worker.join().unwrap().is_success());

    // The grant stuck; no further prompting.
    assert!(context.open_route("/home").is_success());
    assert_eq!(
        context.open_route("/missing").error,
        Some(trellis_core::ErrorCode::RouteNotFound)
    );
    // Empty arguments are rejected before the permission gate.
    assert_eq!(
        context.open_route("").error,
        Some(trellis_core::ErrorCode::InvalidArgument)
    );
}

#[test]
fn test_unwired_operations_report_unavailable() {
    let temp = TempDir::new().unwrap();
    let config = Arc::new(PluginConfigStore::new(temp.path().join("c.json")));
    let host = PluginHost::new(config.clone());
    config.set_permission_state("demo", "broadcast", PermissionState::Granted);

    let context = PluginContext::new(
        &host,
        manifest("demo", "1.0"),
        false,
        Arc::new(ShellRegistry::new()),
        Arc::new(HostHandlers::default()),
        PluginPaths::under(temp.path()),
        None,
    );
    assert_eq!(
        context.broadcast("chan", serde_json::json!({})).error,
        Some(trellis_core::ErrorCode::OperationUnavailable)
    );
    assert_eq!(
        context.open_settings_tab("general").error,
        Some(trellis_core::ErrorCode::SettingsUnavailable)
    );
}

// ---- import and delete ------------------------------------------------

#[test]
fn test_import_script_mints_external_library_permissions() {
    let mut fixture = Fixture::new();
    fixture.loader.register("notifier", || {
        Box::new(TestPlugin {
            manifest: manifest("demo.notifier", "0.1.0").with_permission("app_route"),
            on_activate: noop(),
        })
    });
    let (mut manager, temp) = fixture.manager();
    manager.discover();

    let package = temp.path().join("notifier.lua");
    fs::write(
        &package,
        "local http = require(\"socket.http\")\nlocal s = require 'string'\n",
    )
    .unwrap();
    let result = manager.import_plugin(&package).unwrap();

    assert!(result.error.is_none());
    assert_eq!(result.identifier.as_deref(), Some("demo.notifier"));
    assert!(
        result
            .requested_permissions
            .contains(&"external-library:socket".to_string())
    );
    assert!(result.requested_permissions.contains(&"app_route".to_string()));
    // 'string' is on the allow-list; no permission minted for it.
    assert!(
        !result
            .requested_permissions
            .iter()
            .any(|p| p.contains("string"))
    );

    let info = manager.get("demo.notifier").unwrap();
    assert!(!info.enabled);
    assert_eq!(info.status, PluginStatus::Disabled);
    assert_eq!(
        info.permission_states["external-library:socket"],
        PermissionState::Prompt
    );
    assert!(manager.host().catalog.contains("external-library:socket"));
    assert!(!manager.host().config.is_enabled("demo.notifier"));
}

#[test]
fn test_import_zip_archive_resolves_entry() {
    let mut fixture = Fixture::new();
    fixture.loader.register("pack", || {
        Box::new(TestPlugin {
            manifest: manifest("demo.pack", "0.1.0"),
            on_activate: noop(),
        })
    });
    let (mut manager, temp) = fixture.manager();
    manager.discover();

    let package = temp.path().join("pack.zip");
    {
        let file = fs::File::create(&package).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("main.lua", options).unwrap();
        writer
            .write_all(b"local json = require('json')\n")
            .unwrap();
        writer.finish().unwrap();
    }

    let result = manager.import_plugin(&package).unwrap();
    assert!(result.error.is_none());
    assert!(result.destination.is_dir());
    assert!(result.destination.join("main.lua").is_file());
    assert!(
        result
            .requested_permissions
            .contains(&"external-library:json".to_string())
    );
}

#[test]
fn test_import_rejects_duplicates_and_junk() {
    let mut fixture = Fixture::new();
    fixture.add_plugin("alpha", manifest("demo.alpha", "1.0.0"), noop());
    fixture.loader.register("again", || {
        Box::new(TestPlugin {
            manifest: manifest("demo.alpha", "9.9.9"),
            on_activate: noop(),
        })
    });
    let (mut manager, temp) = fixture.manager();
    manager.discover();

    let package = temp.path().join("again.lua");
    fs::write(&package, "-- duplicate identifier\n").unwrap();
    let error = manager.import_plugin(&package).unwrap_err();
    assert!(error.to_string().contains("demo.alpha"));

    let missing = temp.path().join("nope.lua");
    assert!(manager.import_plugin(&missing).is_err());

    let junk = temp.path().join("podcast.mp3");
    fs::write(&junk, b"not a plugin").unwrap();
    assert!(manager.import_plugin(&junk).is_err());
}

#[test]
fn test_delete_guards_builtins_and_dependents() {
    let mut fixture = Fixture::new();
    fixture.add_plugin("core", manifest("demo.core", "1.0.0"), noop());
    fixture.add_plugin(
        "ext",
        manifest("demo.ext", "1.0.0").with_dependency("demo.lib"),
        noop(),
    );
    fixture.add_plugin("lib", manifest("demo.lib", "1.0.0"), noop());
    fixture.builtins.insert("demo.core".to_string());
    let (mut manager, _temp) = fixture.manager();
    manager.discover();

    assert!(manager.delete_plugin("demo.core").is_err());
    // 'demo.ext' is enabled and depends on 'demo.lib'.
    assert!(manager.delete_plugin("demo.lib").is_err());

    manager.set_enabled("demo.ext", false);
    let lib_path = manager.get("demo.lib").unwrap().source_path.clone().unwrap();
    manager.delete_plugin("demo.lib").unwrap();
    assert!(!lib_path.exists());
    assert!(manager.get("demo.lib").is_none());
    assert!(
        !manager
            .host()
            .config
            .all_plugins()
            .iter()
            .any(|entry| entry.identifier == "demo.lib")
    );
}

// ---- session teardown -------------------------------------------------

#[test]
fn test_reset_session_unblocks_and_clears() {
    let temp = TempDir::new().unwrap();
    let config = Arc::new(PluginConfigStore::new(temp.path().join("c.json")));
    let host = PluginHost::new(config.clone());
    config.set_permission_state("demo", "app_route", PermissionState::Granted);

    host.events
        .register_event("demo", "tick", "Periodic tick", None, false);
    host.events.emit("demo", "tick", serde_json::json!({}));
    let data = GlobalDataAccess::new("demo", host.data.clone());
    data.register_namespace("scratch", "", None, false).unwrap();
    data.publish("scratch", "x", serde_json::json!(1)).unwrap();

    let worker = {
        let prompts = host.prompts.clone();
        std::thread::spawn(move || prompts.request("demo", "unseen", None))
    };
    {
        let prompts = host.prompts.clone();
        wait_until(move || prompts.active().is_some());
    }

    host.reset_session("restarting plugins");
    assert!(matches!(
        worker.join().unwrap(),
        PromptOutcome::Cancelled(_)
    ));
    assert!(host.events.definitions().is_empty());
    assert!(host.data.list_namespaces().is_empty());
    // Persisted decisions survive the teardown.
    assert_eq!(
        config.permission_state("demo", "app_route"),
        PermissionState::Granted
    );
}
