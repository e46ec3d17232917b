//! Declarative pub/sub event bus shared by all plugins.
//!
//! Event types are announced with an owner and an optional permission
//! gate. The bus retains the single most recent event per type so a
//! late subscriber can opt into replaying it. Listener panics are
//! isolated; one misbehaving plugin never breaks delivery to the rest.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use serde::Serialize;

/// Callback deciding whether `plugin` currently holds `permission`.
/// Shared with the data store; typically backed by the config store.
pub type PermissionResolver = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

pub type EventHandler = Arc<dyn Fn(&PluginEvent) + Send + Sync>;

/// Announced metadata for one event type.
#[derive(Debug, Clone, Serialize)]
pub struct EventDefinition {
    pub event_type: String,
    pub description: String,
    /// Permission a subscriber must hold to receive this event.
    pub permission: Option<String>,
}

/// A delivered event. `source` is the emitting plugin's identifier.
#[derive(Debug, Clone, Serialize)]
pub struct PluginEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub source: String,
}

/// Handle returned by `subscribe`, required to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    event_type: String,
    id: u64,
}

impl Subscription {
    pub fn event_type(&self) -> &str {
        &self.event_type
    }
}

struct Listener {
    id: u64,
    plugin_id: String,
    handler: EventHandler,
}

#[derive(Default)]
struct BusState {
    definitions: IndexMap<String, EventDefinition>,
    owners: HashMap<String, String>,
    listeners: HashMap<String, Vec<Listener>>,
    last_events: HashMap<String, PluginEvent>,
    next_id: u64,
}

pub struct EventBus {
    state: Mutex<BusState>,
    resolver: Option<PermissionResolver>,
}

impl EventBus {
    /// A bus without a resolver delivers permission-gated events to
    /// nobody; hosts always supply one in practice.
    pub fn new(resolver: Option<PermissionResolver>) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            resolver,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn can_receive(&self, plugin_id: &str, definition: Option<&EventDefinition>) -> bool {
        let Some(permission) = definition.and_then(|d| d.permission.as_deref()) else {
            return true;
        };
        match &self.resolver {
            Some(resolver) => resolver(plugin_id, permission),
            None => false,
        }
    }

    /// Announces an event type. A second announcement by a different
    /// owner is ignored with a warning unless `overwrite` is set; the
    /// same owner may refresh its own metadata freely.
    pub fn register_event(
        &self,
        owner: &str,
        event_type: &str,
        description: &str,
        permission: Option<String>,
        overwrite: bool,
    ) {
        let mut state = self.lock();
        if !overwrite {
            if let Some(existing_owner) = state.owners.get(event_type) {
                if existing_owner != owner {
                    tracing::warn!(
                        target: "plugin",
                        "event type '{event_type}' already announced by '{existing_owner}', \
                         ignoring announcement from '{owner}'"
                    );
                    return;
                }
            }
        }
        state.owners.insert(event_type.to_string(), owner.to_string());
        state.definitions.insert(
            event_type.to_string(),
            EventDefinition {
                event_type: event_type.to_string(),
                description: description.to_string(),
                permission,
            },
        );
    }

    pub fn definitions(&self) -> Vec<EventDefinition> {
        self.lock().definitions.values().cloned().collect()
    }

    /// Registers a listener. With `replay_last`, the retained event
    /// for this type (if any, and if permitted) is delivered exactly
    /// once, synchronously, before this call returns.
    pub fn subscribe(
        &self,
        plugin_id: &str,
        event_type: &str,
        handler: EventHandler,
        replay_last: bool,
    ) -> Subscription {
        let (id, replay) = {
            let mut state = self.lock();
            if !state.definitions.contains_key(event_type) {
                tracing::warn!(
                    target: "plugin",
                    "'{plugin_id}' subscribed to unannounced event type '{event_type}'"
                );
            }
            state.next_id += 1;
            let id = state.next_id;
            state
                .listeners
                .entry(event_type.to_string())
                .or_default()
                .push(Listener {
                    id,
                    plugin_id: plugin_id.to_string(),
                    handler: handler.clone(),
                });

            let definition = state.definitions.get(event_type).cloned();
            let replay = if replay_last && self.can_receive(plugin_id, definition.as_ref()) {
                state.last_events.get(event_type).cloned()
            } else {
                None
            };
            (id, replay)
        };

        // Replay happens outside the lock so the handler may call
        // back into the bus.
        if let Some(event) = replay {
            Self::deliver(&handler, &event);
        }

        Subscription {
            event_type: event_type.to_string(),
            id,
        }
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut state = self.lock();
        let Some(listeners) = state.listeners.get_mut(&subscription.event_type) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|listener| listener.id != subscription.id);
        before != listeners.len()
    }

    /// Removes every listener a plugin registered, across all types.
    pub fn remove_plugin(&self, plugin_id: &str) {
        let mut state = self.lock();
        for listeners in state.listeners.values_mut() {
            listeners.retain(|listener| listener.plugin_id != plugin_id);
        }
    }

    /// Publishes an event to every permitted listener and retains it
    /// as the type's replay candidate. Listeners are snapshotted
    /// before delivery, so handlers may subscribe or unsubscribe
    /// re-entrantly.
    pub fn emit(&self, source: &str, event_type: &str, payload: serde_json::Value) {
        let event = PluginEvent {
            event_type: event_type.to_string(),
            payload,
            source: source.to_string(),
        };
        let targets: Vec<EventHandler> = {
            let mut state = self.lock();
            if !state.definitions.contains_key(event_type) {
                tracing::warn!(
                    target: "plugin",
                    "'{source}' emitted unannounced event type '{event_type}'"
                );
            }
            state
                .last_events
                .insert(event_type.to_string(), event.clone());
            let definition = state.definitions.get(event_type).cloned();
            state
                .listeners
                .get(event_type)
                .map(|listeners| {
                    listeners
                        .iter()
                        .filter(|listener| {
                            self.can_receive(&listener.plugin_id, definition.as_ref())
                        })
                        .map(|listener| listener.handler.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        for handler in targets {
            Self::deliver(&handler, &event);
        }
    }

    fn deliver(handler: &EventHandler, event: &PluginEvent) {
        let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));
        if outcome.is_err() {
            tracing::error!(
                target: "plugin",
                "event handler panicked while processing '{}'",
                event.event_type
            );
        }
    }

    /// Drops all listeners and retained events but keeps the
    /// announced definitions.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.listeners.clear();
        state.last_events.clear();
    }

    /// Full teardown, used when the plugin session is rebuilt.
    pub fn clear_all(&self) {
        let mut state = self.lock();
        *state = BusState::default();
    }
}
