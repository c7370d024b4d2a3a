//! Configuration structures for runnr.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, epochs, fuel)
//! - [`ExecutionConfig`]: Per-instance execution limits (fuel, memory)
//! - [`WorkerOptions`]: Per-job-type worker settings (pool size, autoscale, timeout, retries)

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// It can be loaded from a TOML file through [`crate::ConfigFile`] or built in code.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-instance execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Default options for workers registered from a bundle.
    #[serde(default)]
    pub worker: WorkerOptions,
}

/// Wasmtime engine configuration.
///
/// These settings affect the global Wasmtime engine behavior shared by
/// every Wasm environment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for faster instance creation.
    ///
    /// Memory slots are reserved up front for `max_instances` instances.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Enable epoch-based interruption.
    ///
    /// Guests yield back to the async executor on every epoch tick, which
    /// lets a job timeout cancel a guest stuck in a loop.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,

    /// Interval between epoch ticks in milliseconds.
    #[serde(default = "defaults::epoch_tick_ms")]
    pub epoch_tick_ms: u64,

    /// Enable fuel metering.
    ///
    /// When enabled, every job starts with `ExecutionConfig::max_fuel`.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            epoch_interruption: defaults::epoch_interruption(),
            epoch_tick_ms: defaults::epoch_tick_ms(),
            fuel_metering: defaults::fuel_metering(),
        }
    }
}

impl EngineConfig {
    /// Get the epoch tick interval as a `Duration`.
    pub fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms.max(1))
    }
}

/// Per-instance execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Maximum fuel (CPU instructions) per job.
    ///
    /// Only used when `EngineConfig::fuel_metering` is enabled.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Maximum linear memory in megabytes.
    #[serde(default = "defaults::max_memory_mb")]
    pub max_memory_mb: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_fuel: defaults::max_fuel(),
            max_memory_mb: defaults::max_memory_mb(),
        }
    }
}

impl ExecutionConfig {
    /// Get the memory limit in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        (self.max_memory_mb as usize) * 1024 * 1024
    }
}

/// Options for a single worker.
///
/// `pool_size` is the floor the autoscaler never goes below and the size a
/// pre-warmed worker starts with; `autoscale_max` is the ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WorkerOptions {
    /// Number of work threads (and instances) to start with.
    #[serde(default = "defaults::pool_size")]
    pub pool_size: usize,

    /// Upper bound for autoscaling. Values below `pool_size` disable growth.
    #[serde(default = "defaults::autoscale_max")]
    pub autoscale_max: usize,

    /// Per-job timeout in seconds; 0 disables it.
    #[serde(default)]
    pub job_timeout_seconds: u64,

    /// Attempts at starting a thread before giving up.
    #[serde(default = "defaults::num_retries")]
    pub num_retries: u32,

    /// Delay between start attempts in seconds.
    #[serde(default = "defaults::retry_secs")]
    pub retry_secs: u64,

    /// Start `pool_size` threads at registration instead of on first job.
    #[serde(default)]
    pub pre_warm: bool,

    /// Capacity of the worker's job queue.
    #[serde(default = "defaults::queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            pool_size: defaults::pool_size(),
            autoscale_max: defaults::autoscale_max(),
            job_timeout_seconds: 0,
            num_retries: defaults::num_retries(),
            retry_secs: defaults::retry_secs(),
            pre_warm: false,
            queue_capacity: defaults::queue_capacity(),
        }
    }
}

impl WorkerOptions {
    /// Set the initial pool size.
    #[must_use]
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    /// Allow autoscaling up to `max` threads. `0` means one per CPU.
    #[must_use]
    pub fn autoscale(mut self, max: usize) -> Self {
        self.autoscale_max = if max == 0 {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        } else {
            max
        };
        self
    }

    /// Bound each job to `seconds`.
    #[must_use]
    pub fn timeout(mut self, seconds: u64) -> Self {
        self.job_timeout_seconds = seconds;
        self
    }

    /// Configure thread start retries.
    #[must_use]
    pub fn retry(mut self, retry_secs: u64, num_retries: u32) -> Self {
        self.retry_secs = retry_secs;
        self.num_retries = num_retries;
        self
    }

    /// Start threads at registration.
    #[must_use]
    pub fn pre_warm(mut self) -> Self {
        self.pre_warm = true;
        self
    }

    /// Set the job queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// The effective autoscale ceiling, never below `pool_size`.
    pub fn max_threads(&self) -> usize {
        self.autoscale_max.max(self.pool_size)
    }

    /// Get the job timeout, if any.
    pub fn job_timeout(&self) -> Option<Duration> {
        (self.job_timeout_seconds > 0).then(|| Duration::from_secs(self.job_timeout_seconds))
    }

    /// Get the delay between thread start attempts.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_secs)
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        false
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn epoch_tick_ms() -> u64 {
        10
    }

    pub const fn fuel_metering() -> bool {
        false
    }

    pub const fn max_fuel() -> u64 {
        10_000_000
    }

    pub const fn max_memory_mb() -> u32 {
        128
    }

    pub const fn pool_size() -> usize {
        1
    }

    pub const fn autoscale_max() -> usize {
        1
    }

    pub const fn num_retries() -> u32 {
        5
    }

    pub const fn retry_secs() -> u64 {
        3
    }

    pub const fn queue_capacity() -> usize {
        256
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();

        assert!(!config.engine.pooling_allocator);
        assert_eq!(config.engine.max_instances, 1000);
        assert!(config.engine.epoch_interruption);
        assert!(!config.engine.fuel_metering);
        assert_eq!(config.execution.max_fuel, 10_000_000);

        assert_eq!(config.worker.pool_size, 1);
        assert_eq!(config.worker.job_timeout_seconds, 0);
        assert_eq!(config.worker.num_retries, 5);
        assert_eq!(config.worker.retry_secs, 3);
        assert!(!config.worker.pre_warm);
        assert_eq!(config.worker.queue_capacity, 256);
    }

    #[test]
    fn test_config_serialization() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: RuntimeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.engine.max_instances, deserialized.engine.max_instances);
        assert_eq!(config.worker, deserialized.worker);
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"worker": {"pool_size": 4, "job_timeout_seconds": 2}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.worker.pool_size, 4);
        assert_eq!(config.worker.job_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(config.worker.queue_capacity, 256);
        assert!(config.engine.epoch_interruption);
    }

    #[test]
    fn test_worker_options_builders() {
        let opts = WorkerOptions::default()
            .with_pool_size(2)
            .autoscale(8)
            .timeout(5)
            .retry(1, 3)
            .pre_warm();

        assert_eq!(opts.pool_size, 2);
        assert_eq!(opts.max_threads(), 8);
        assert_eq!(opts.job_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(opts.retry_delay(), Duration::from_secs(1));
        assert_eq!(opts.num_retries, 3);
        assert!(opts.pre_warm);
    }

    #[test]
    fn test_autoscale_zero_uses_cpu_count() {
        let opts = WorkerOptions::default().autoscale(0);
        assert!(opts.autoscale_max >= 1);
    }

    #[test]
    fn test_max_threads_never_below_pool_size() {
        let opts = WorkerOptions::default().with_pool_size(4);
        assert_eq!(opts.max_threads(), 4);
        assert_eq!(WorkerOptions::default().job_timeout(), None);
    }
}
