//! The `runnr.toml` file read by the binary.
//!
//! - [`ConfigFile`]: runtime settings plus where to find the bundle and logs
//! - [`BundleConfig`]: where the application bundle lives
//! - [`LoggingConfig`]: log filter and output file
//!
//! Command line flags and `RUNNR_*` variables take precedence over the file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;

/// Contents of a `runnr.toml`. Every section is optional.
///
/// # Example
///
/// ```toml
/// [runtime.engine]
/// fuel_metering = true
///
/// [runtime.execution]
/// max_fuel = 10_000_000
///
/// [runtime.worker]
/// pool_size = 2
/// autoscale_max = 8
/// job_timeout_seconds = 10
///
/// [bundle]
/// path = "./runnables.wasm.zip"
///
/// [logging]
/// level = "info,runnr=debug"
/// file = "./runnr.log"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (engine, execution and worker settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Bundle location.
    #[serde(default)]
    pub bundle: BundleConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ConfigFile {
    /// Read, parse and validate `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file is unreadable, is not valid TOML, or holds
    /// settings the runtime cannot start with.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigFileError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let config = Self::from_toml(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without validating it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigFileError::Parse`] for malformed TOML or unknown value types.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }

    /// Reject settings that would leave workers unable to run jobs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigFileError::Invalid`] naming the first bad setting.
    pub fn validate(&self) -> Result<(), ConfigFileError> {
        let worker = &self.runtime.worker;
        if worker.pool_size == 0 {
            return Err(ConfigFileError::invalid("runtime.worker.pool_size must be at least 1"));
        }
        if worker.queue_capacity == 0 {
            return Err(ConfigFileError::invalid(
                "runtime.worker.queue_capacity must be at least 1",
            ));
        }

        let engine = &self.runtime.engine;
        if engine.pooling_allocator && engine.max_instances == 0 {
            return Err(ConfigFileError::invalid(
                "runtime.engine.max_instances must be at least 1 with the pooling allocator",
            ));
        }
        if engine.fuel_metering && self.runtime.execution.max_fuel == 0 {
            return Err(ConfigFileError::invalid(
                "runtime.execution.max_fuel must be non-zero when fuel metering is on",
            ));
        }

        if matches!(self.bundle.path.as_deref(), Some("")) {
            return Err(ConfigFileError::invalid("bundle.path is empty"));
        }

        Ok(())
    }
}

/// Bundle location.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BundleConfig {
    /// Path to the bundle zip.
    pub path: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive such as `info,runnr=debug`.
    pub level: Option<String>,

    /// Append JSON log lines to this file instead of writing to stdout.
    pub file: Option<String>,
}

/// Errors loading a `runnr.toml`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("Cannot read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed runnr.toml: {message}")]
    Parse { message: String },

    /// The file parsed but a setting is out of range.
    #[error("Invalid runnr.toml: {reason}")]
    Invalid { reason: String },
}

impl ConfigFileError {
    fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = ConfigFile::from_toml("").unwrap();

        assert!(config.bundle.path.is_none());
        assert!(config.logging.level.is_none());
        assert!(config.logging.file.is_none());
        assert_eq!(config.runtime.worker.pool_size, 1);
        assert_eq!(config.runtime.worker.queue_capacity, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_all_sections() {
        let toml = r#"
            [runtime.engine]
            pooling_allocator = true
            max_instances = 64
            fuel_metering = true

            [runtime.execution]
            max_fuel = 2_000_000

            [runtime.worker]
            pool_size = 2
            autoscale_max = 8
            job_timeout_seconds = 10
            pre_warm = true

            [bundle]
            path = "./app.wasm.zip"

            [logging]
            level = "debug"
            file = "/tmp/runnr.log"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.runtime.engine.max_instances, 64);
        assert_eq!(config.runtime.execution.max_fuel, 2_000_000);
        assert_eq!(config.runtime.worker.max_threads(), 8);
        assert_eq!(config.runtime.worker.job_timeout_seconds, 10);
        assert!(config.runtime.worker.pre_warm);
        assert_eq!(config.bundle.path.as_deref(), Some("./app.wasm.zip"));
        assert_eq!(config.logging.level.as_deref(), Some("debug"));
        assert_eq!(config.logging.file.as_deref(), Some("/tmp/runnr.log"));
    }

    #[test]
    fn test_malformed_toml() {
        let err = ConfigFile::from_toml("[runtime.worker\npool_size = 2").unwrap_err();
        assert!(matches!(err, ConfigFileError::Parse { .. }));
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let config = ConfigFile::from_toml("[runtime.worker]\npool_size = 0").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pool_size"), "{err}");
    }

    #[test]
    fn test_fuel_metering_needs_fuel() {
        let toml = "[runtime.engine]\nfuel_metering = true\n[runtime.execution]\nmax_fuel = 0";
        let config = ConfigFile::from_toml(toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigFileError::Invalid { .. })));
    }

    #[test]
    fn test_from_file_validates() {
        let dir = std::env::temp_dir().join(format!("runnr-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("runnr.toml");
        std::fs::write(&path, "[bundle]\npath = \"\"").unwrap();

        let err = ConfigFile::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigFileError::Invalid { .. }));

        let err = ConfigFile::from_file(dir.join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigFileError::Io { .. }));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
