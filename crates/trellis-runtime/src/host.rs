//! Long-lived runtime services, constructed once at startup.

use std::sync::Arc;

use trellis_core::PermissionCatalog;

use crate::config::PluginConfigStore;
use crate::data::GlobalDataStore;
use crate::events::{EventBus, PermissionResolver};
use crate::prompt::PromptCoordinator;

/// Bundle of the session-wide services plugins are wired to. Cloning
/// is cheap; every field is shared.
///
/// The config store doubles as the permission resolver for the event
/// bus and the data store, so a decision made through a prompt is
/// visible to both immediately.
#[derive(Clone)]
pub struct PluginHost {
    pub catalog: Arc<PermissionCatalog>,
    pub config: Arc<PluginConfigStore>,
    pub events: Arc<EventBus>,
    pub data: Arc<GlobalDataStore>,
    pub prompts: Arc<PromptCoordinator>,
}

impl PluginHost {
    pub fn new(config: Arc<PluginConfigStore>) -> Self {
        let resolver: PermissionResolver = {
            let config = config.clone();
            Arc::new(move |plugin_id: &str, permission: &str| {
                config.permission_state(plugin_id, permission).is_granted()
            })
        };
        Self {
            catalog: Arc::new(PermissionCatalog::builtin()),
            events: Arc::new(EventBus::new(Some(resolver.clone()))),
            data: Arc::new(GlobalDataStore::new(Some(resolver))),
            prompts: Arc::new(PromptCoordinator::new(config.clone())),
            config,
        }
    }

    /// Tears down session state before plugins are re-discovered:
    /// unblocks every pending prompt and drops listeners, retained
    /// events and shared data. Persisted decisions are untouched.
    pub fn reset_session(&self, reason: &str) {
        self.prompts.cancel_all(reason);
        self.events.clear_all();
        self.data.clear();
    }
}
