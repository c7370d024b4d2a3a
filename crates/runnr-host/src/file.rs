//! Read-only static files.

use std::sync::Arc;

use runnr_common::CapabilityError;

use crate::config::FileConfig;

/// Lookup function for static files, usually a bundle's static area.
pub type StaticFileFn = Arc<dyn Fn(&str) -> Result<Vec<u8>, CapabilityError> + Send + Sync>;

/// File capability.
pub trait FileCapability: Send + Sync {
    /// Contents of the static file `name`.
    fn get_static(&self, name: &str) -> Result<Vec<u8>, CapabilityError>;
}

/// File capability that delegates to a [`StaticFileFn`].
#[derive(Clone)]
pub struct FileSource {
    enabled: bool,
    static_fn: Option<StaticFileFn>,
}

impl FileSource {
    pub fn new(config: FileConfig, static_fn: Option<StaticFileFn>) -> Self {
        Self {
            enabled: config.enabled,
            static_fn,
        }
    }
}

impl std::fmt::Debug for FileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSource")
            .field("enabled", &self.enabled)
            .field("has_static_fn", &self.static_fn.is_some())
            .finish()
    }
}

impl FileCapability for FileSource {
    fn get_static(&self, name: &str) -> Result<Vec<u8>, CapabilityError> {
        match (&self.static_fn, self.enabled) {
            (Some(lookup), true) => lookup(name),
            _ => Err(CapabilityError::NotEnabled { capability: "file" }),
        }
    }
}
