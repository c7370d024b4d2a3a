//! Common types, errors, and utilities for runnr.
//!
//! This crate provides shared functionality used across the runnr workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for engine, execution and scheduler settings
//! - The [`CoordinatedRequest`] envelope handed to request-shaped jobs
//! - [`LoadingCache`], a keyed store with per-entry load coordination

pub mod config;
pub mod config_file;
pub mod error;
pub mod loading_cache;
pub mod request;

pub use config::{EngineConfig, ExecutionConfig, RuntimeConfig, WorkerOptions};
pub use config_file::{ConfigFile, ConfigFileError};
pub use error::{BundleError, CacheError, CapabilityError, RunErr, RuntimeError};
pub use loading_cache::{EntryState, LoadingCache, Value};
pub use request::{CoordinatedRequest, CoordinatedResponse, FieldType};
