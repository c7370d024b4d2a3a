//! Error types for runnr.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Top-level errors surfaced on a job's result
//! - [`RunErr`]: An error published by a guest through `return_error`/`return_abort`
//! - [`CapabilityError`]: Errors from capability implementations, mapped to FFI sentinels
//! - [`BundleError`]: Bundle and Directive loading failures
//! - [`CacheError`]: Loading cache entry errors

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level runtime errors.
///
/// These cover the whole lifecycle of a job: scheduling, compiling and
/// instantiating a Runnable, and executing it.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The requested module was not found in the bundle or on disk.
    #[error("Module not found: {module_id}")]
    ModuleNotFound {
        /// The identifier of the module that was not found.
        module_id: String,
    },

    /// WebAssembly compilation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// Instantiating a compiled module (or running its start hooks) failed.
    #[error("Instantiation failed: {reason}")]
    Instantiation {
        /// Description of the instantiation failure.
        reason: String,
    },

    /// A required guest export is missing.
    #[error("Missing export: {name}")]
    MissingExport {
        /// Name of the export.
        name: String,
    },

    /// A WebAssembly trap occurred outside of a guest `run_e` call.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
    },

    /// Execution exhausted the configured fuel limit.
    #[error("Fuel exhausted: CPU limit exceeded")]
    FuelExhausted,

    /// The job did not complete within the worker's timeout.
    #[error("Job timed out after {seconds}s")]
    JobTimeout {
        /// The configured timeout in seconds.
        seconds: u64,
    },

    /// The guest reported an error.
    #[error(transparent)]
    Run(#[from] RunErr),

    /// No worker is registered for the job type.
    #[error("Unknown job type: {job_type}")]
    UnknownJobType {
        /// The job type that has no worker.
        job_type: String,
    },

    /// The worker for the job type has been stopped.
    #[error("Worker stopped: {job_type}")]
    WorkerStopped {
        /// The job type of the stopped worker.
        job_type: String,
    },

    /// The worker could not start any work thread.
    #[error("Worker {job_type} failed to reach pool size after {attempts} attempts: {reason}")]
    PoolStartFailed {
        /// The job type of the worker.
        job_type: String,
        /// Number of attempts made.
        attempts: u32,
        /// The last error seen.
        reason: String,
    },

    /// The job payload could not be converted to the expected shape.
    #[error("Invalid payload: {reason}")]
    Payload {
        /// Why the payload was rejected.
        reason: String,
    },

    /// The producing side of a result went away without sending.
    #[error("Result dropped before completion")]
    ResultDropped,

    /// Guest linear memory access out of bounds.
    #[error("Memory access out of bounds: ptr={ptr}, len={len}")]
    MemoryAccess {
        /// Guest pointer.
        ptr: i32,
        /// Requested length.
        len: i32,
    },

    /// A capability returned an error.
    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    /// A bundle could not be loaded.
    #[error("Bundle error: {0}")]
    Bundle(#[from] BundleError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

/// An error published by a guest module.
///
/// `code` is chosen by the guest. Aborts and traps use `-1`.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("runnable error {code}: {message}")]
pub struct RunErr {
    /// Guest-defined error code.
    pub code: i32,
    /// Human readable message.
    pub message: String,
}

impl RunErr {
    /// Create a new guest error.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Errors from capability implementations.
///
/// Inside a guest call these never cross the FFI boundary as values; they are
/// converted into negative sentinels with [`CapabilityError::sentinel`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    /// The capability is disabled for this execution.
    #[error("Capability not enabled: {capability}")]
    NotEnabled {
        /// Name of the capability.
        capability: &'static str,
    },

    /// A configured rule rejected the operation.
    #[error("Rule violation: {reason}")]
    RuleViolation {
        /// Which rule was violated.
        reason: String,
    },

    /// Invalid argument was passed by the guest.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },

    /// The requested key or file does not exist.
    #[error("Not found: {key}")]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// A downstream service or I/O operation failed.
    #[error("Downstream failure: {reason}")]
    Downstream {
        /// Description of the failure.
        reason: String,
    },

    /// An HTTP call completed with a non-2xx status.
    #[error("HTTP status {status}")]
    HttpStatus {
        /// The response status code.
        status: u16,
    },

    /// A GraphQL response carried errors.
    #[error("GraphQL error: {message}")]
    GraphQl {
        /// Joined error messages.
        message: String,
    },

    /// The request handler has no request bound.
    #[error("Request not set")]
    RequestNotSet,

    /// Unknown request field type code.
    #[error("Invalid field type: {field_type}")]
    InvalidFieldType {
        /// The code supplied by the guest.
        field_type: i32,
    },

    /// Unknown key for the requested field type.
    #[error("Invalid key: {key}")]
    InvalidKey {
        /// The key supplied by the guest.
        key: String,
    },
}

impl CapabilityError {
    /// Create a new `RuleViolation` error.
    pub fn rule_violation(reason: impl Into<String>) -> Self {
        Self::RuleViolation {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidArgument` error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a new `Downstream` error.
    pub fn downstream(reason: impl Into<String>) -> Self {
        Self::Downstream {
            reason: reason.into(),
        }
    }

    /// Create a new `NotFound` error.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// The negative sentinel a host function returns to the guest for this error.
    pub fn sentinel(&self) -> i32 {
        match self {
            Self::NotEnabled { .. } | Self::RequestNotSet => -1,
            Self::RuleViolation { .. }
            | Self::InvalidArgument { .. }
            | Self::InvalidFieldType { .. } => -2,
            Self::NotFound { .. } | Self::InvalidKey { .. } => -3,
            Self::Downstream { .. } | Self::GraphQl { .. } => -4,
            Self::HttpStatus { status } => -i32::from(*status),
        }
    }
}

/// Bundle and Directive errors.
#[derive(Error, Debug)]
pub enum BundleError {
    /// Failed to read or write the bundle file.
    #[error("Failed to access bundle '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The archive is not a readable zip.
    #[error("Invalid bundle archive: {reason}")]
    Zip { reason: String },

    /// The archive has no `Directive.yaml`.
    #[error("Bundle is missing Directive.yaml")]
    MissingDirective,

    /// `Directive.yaml` is not valid YAML for a Directive.
    #[error("Failed to parse Directive: {reason}")]
    DirectiveParse { reason: String },

    /// The Directive failed validation.
    #[error("Invalid Directive: {}", problems.join("; "))]
    Invalid { problems: Vec<String> },

    /// A `.wasm` entry has no matching runnable in the Directive.
    #[error("Module {file} is not listed in the Directive")]
    UnknownRunnable { file: String },

    /// A static file does not exist.
    #[error("Static file does not exist: {path}")]
    NotExist { path: String },

    /// A static file path tried to escape the static area.
    #[error("Invalid static file path: {path}")]
    InvalidPath { path: String },
}

/// Loading cache errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// `put` found an existing entry.
    #[error("Key already exists: {key}")]
    Exists { key: String },

    /// No entry for the key.
    #[error("Key does not exist: {key}")]
    NotExists { key: String },

    /// The load was canceled or the entry dropped.
    #[error("Load canceled")]
    Canceled,

    /// The loader returned an error.
    #[error("Load failed: {reason}")]
    Load { reason: String },
}

impl RuntimeError {
    /// Create a new `ModuleNotFound` error.
    pub fn module_not_found(module_id: impl Into<String>) -> Self {
        Self::ModuleNotFound {
            module_id: module_id.into(),
        }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `Instantiation` error.
    pub fn instantiation(reason: impl Into<String>) -> Self {
        Self::Instantiation {
            reason: reason.into(),
        }
    }

    /// The error for a module that does not export `run_e`.
    pub fn missing_run_e() -> Self {
        Self::MissingExport {
            name: "run_e".into(),
        }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
        }
    }

    /// Create a new `Payload` error.
    pub fn payload(reason: impl Into<String>) -> Self {
        Self::Payload {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error indicates the module was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ModuleNotFound { .. })
    }

    /// Returns `true` if the job ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::JobTimeout { .. })
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(self, Self::FuelExhausted | Self::JobTimeout { .. })
    }

    /// Returns `true` if the job never reached a Runnable.
    pub fn is_scheduling(&self) -> bool {
        matches!(
            self,
            Self::UnknownJobType { .. } | Self::WorkerStopped { .. } | Self::PoolStartFailed { .. }
        )
    }

    /// The guest error, if this error came from the guest.
    pub fn as_run_err(&self) -> Option<&RunErr> {
        match self {
            Self::Run(err) => Some(err),
            _ => None,
        }
    }
}
