//! The plugin interface and the loader seam.
//!
//! Plugins are native implementations of [`Plugin`] resolved through a
//! [`PluginLoader`]. The loader maps a module name taken from the
//! filesystem candidate onto an instance; hosts embedding a script
//! runtime supply their own loader behind the same seam.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

use trellis_core::PluginManifest;

use crate::context::PluginContext;

/// Error type plugins return from activation. Anything that implements
/// `std::error::Error` can be bubbled up with `?`.
pub type ActivationError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A loadable extension. `manifest` must be cheap and side-effect
/// free; all real work happens in `activate`.
pub trait Plugin: Send + Sync {
    fn manifest(&self) -> &PluginManifest;

    /// Called once per session, in dependency order. Returning an
    /// error marks this plugin's record only; other plugins still
    /// activate.
    fn activate(&self, context: &PluginContext) -> Result<(), ActivationError>;
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("module '{module}' is not registered with the loader")]
    NotRegistered { module: String },
    #[error("failed to load plugin module '{module}': {message}")]
    Failed { module: String, message: String },
    #[error("module '{module}' does not expose a plugin instance")]
    NoInstance { module: String },
}

/// Resolves a discovered candidate to a plugin instance.
pub trait PluginLoader: Send + Sync {
    /// `module` is the candidate's stem (file name without extension,
    /// or directory name); `path` is the candidate itself.
    fn load(&self, module: &str, path: &Path) -> Result<Box<dyn Plugin>, LoadError>;
}

type PluginFactory = Box<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// Loader backed by a static registry of native factories. The file
/// on disk acts as the installation marker; the factory provides the
/// implementation.
#[derive(Default)]
pub struct StaticPluginLoader {
    factories: HashMap<String, PluginFactory>,
}

impl StaticPluginLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, module: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.insert(module.into(), Box::new(factory));
    }

    pub fn is_registered(&self, module: &str) -> bool {
        self.factories.contains_key(module)
    }
}

impl PluginLoader for StaticPluginLoader {
    fn load(&self, module: &str, _path: &Path) -> Result<Box<dyn Plugin>, LoadError> {
        match self.factories.get(module) {
            Some(factory) => Ok(factory()),
            None => Err(LoadError::NotRegistered {
                module: module.to_string(),
            }),
        }
    }
}
