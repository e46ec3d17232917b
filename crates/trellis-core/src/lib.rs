//! Core types for the trellis plugin runtime.
//!
//! This crate holds the leaf data structures shared across the
//! workspace: the tri-state permission model and capability catalog,
//! plugin manifests with their dependency grammar, the operation
//! result envelope, and the derived runtime status records. It has no
//! I/O; everything stateful lives in `trellis-runtime`.

mod manifest;
mod permission;
mod result;
mod status;

pub use manifest::{
    Comparator, DependencySpec, ManifestError, PluginKind, PluginManifest, compare_versions,
};
pub use permission::{
    EXTERNAL_LIBRARY_PREFIX, PermissionCatalog, PermissionInfo, PermissionState,
    ensure_permission_states, normalize_permission_value,
};
pub use result::{ErrorCode, OperationResult};
pub use status::{PluginRuntimeInfo, PluginStatus};
