//! Permission model: tri-state decisions and the capability catalog.

use std::collections::BTreeMap;
use std::sync::Mutex;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::Display;

/// Prefix used for permissions minted at import time for modules a
/// plugin pulls in from outside the allow-list.
pub const EXTERNAL_LIBRARY_PREFIX: &str = "external-library:";

/// Decision recorded for a single plugin capability.
///
/// `Prompt` is the default for every declared permission that has never
/// been decided: the user is asked the first time the capability is
/// exercised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PermissionState {
    Granted,
    Denied,
    #[default]
    Prompt,
}

impl PermissionState {
    pub fn is_granted(self) -> bool {
        matches!(self, PermissionState::Granted)
    }

    pub fn is_denied(self) -> bool {
        matches!(self, PermissionState::Denied)
    }

    /// Normalizes a free-form string into a decision.
    ///
    /// Accepts legacy aliases from older persisted documents. Anything
    /// unrecognized falls back to `Prompt` so a corrupted value can
    /// never silently widen a grant.
    pub fn normalize(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "granted" | "allow" | "allowed" | "true" => PermissionState::Granted,
            "denied" | "deny" | "false" => PermissionState::Denied,
            _ => PermissionState::Prompt,
        }
    }
}

impl From<bool> for PermissionState {
    fn from(granted: bool) -> Self {
        if granted {
            PermissionState::Granted
        } else {
            PermissionState::Denied
        }
    }
}

/// Normalizes an arbitrary JSON value from a persisted document into a
/// decision. Booleans map onto granted/denied; strings go through
/// [`PermissionState::normalize`]; every other shape means `Prompt`.
pub fn normalize_permission_value(value: &serde_json::Value) -> PermissionState {
    match value {
        serde_json::Value::Bool(granted) => PermissionState::from(*granted),
        serde_json::Value::String(text) => PermissionState::normalize(text),
        _ => PermissionState::Prompt,
    }
}

/// Merges a plugin's declared permission list with already-recorded
/// decisions. Existing decisions are kept verbatim; declared
/// permissions without a decision default to `Prompt`. Recorded
/// decisions for permissions no longer declared are preserved so a
/// plugin update cannot shed a denial.
pub fn ensure_permission_states(
    declared: &[String],
    existing: &BTreeMap<String, PermissionState>,
) -> BTreeMap<String, PermissionState> {
    let mut states = existing.clone();
    for permission in declared {
        states
            .entry(permission.clone())
            .or_insert(PermissionState::Prompt);
    }
    states
}

/// Human-readable description of a single capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionInfo {
    pub id: String,
    pub name: String,
    pub description: String,
}

impl PermissionInfo {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Open catalog of known capabilities.
///
/// Seeded with the host's builtin set; import can mint additional
/// `external-library:` entries at runtime, so lookups go through a
/// mutex rather than a static table. Registration order is preserved
/// for display purposes.
#[derive(Debug, Default)]
pub struct PermissionCatalog {
    entries: Mutex<IndexMap<String, PermissionInfo>>,
}

impl PermissionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog pre-populated with the capabilities the host itself
    /// understands.
    pub fn builtin() -> Self {
        let catalog = Self::new();
        for (id, name, description) in [
            (
                "app_route",
                "Open routes",
                "Navigate the host application to an arbitrary route",
            ),
            (
                "app_home",
                "Switch home view",
                "Change which navigation view the home screen shows",
            ),
            (
                "app_settings",
                "Open settings",
                "Jump to a tab of the host settings page",
            ),
            (
                "primary_action",
                "Invoke primary action",
                "Trigger the host's primary action with a plugin-chosen argument",
            ),
            (
                "broadcast",
                "Inter-process broadcast",
                "Send and receive broadcast messages across host processes",
            ),
            (
                "global_data.read",
                "Read shared data",
                "Read entries other plugins publish to the shared data store",
            ),
            (
                "global_data.write",
                "Publish shared data",
                "Publish entries to owned namespaces in the shared data store",
            ),
            (
                "events.subscribe",
                "Subscribe to events",
                "Listen for events other plugins announce",
            ),
            (
                "events.emit",
                "Emit events",
                "Announce events for other plugins to consume",
            ),
        ] {
            catalog.register(PermissionInfo::new(id, name, description));
        }
        catalog
    }

    /// Adds a capability. Re-registering an id replaces its metadata.
    pub fn register(&self, info: PermissionInfo) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(info.id.clone(), info);
    }

    pub fn lookup(&self, id: &str) -> Option<PermissionInfo> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(id)
    }

    /// All known capabilities in registration order.
    pub fn entries(&self) -> Vec<PermissionInfo> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.values().cloned().collect()
    }

    /// Ensures an `external-library:<root>` capability exists for a
    /// module pulled in from outside the allow-list, returning its id.
    pub fn mint_external_library(&self, root: &str) -> String {
        let id = format!("{EXTERNAL_LIBRARY_PREFIX}{root}");
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.entry(id.clone()).or_insert_with(|| {
            PermissionInfo::new(
                id.clone(),
                format!("Use library {root}"),
                format!("Load the external library '{root}' at activation time"),
            )
        });
        id
    }
}
