//! Wasmtime engine configuration and creation.
//!
//! One [`WasmEngine`] is shared by every Wasm environment in the process:
//! - async support so host functions can await capabilities
//! - optional pooling allocator for cheap instance replacement
//! - optional fuel metering, reset per job
//! - epoch interruption driven by a background ticker, so guests yield and
//!   a job timeout can cancel a guest stuck in a loop

use std::time::Duration;

use tracing::{debug, info};
use wasmtime::{Config, Engine, EngineWeak, InstanceAllocationStrategy, PoolingAllocationConfig};

use runnr_common::{EngineConfig, RuntimeError};

/// Thread-safe WebAssembly engine wrapper.
///
/// Cloning is cheap; every clone refers to the same Wasmtime engine.
#[derive(Clone)]
pub struct WasmEngine {
    engine: Engine,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new engine with the given configuration.
    ///
    /// When epoch interruption is enabled a ticker thread is started; it
    /// stops once the last clone of the engine is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the Wasmtime configuration is invalid or the
    /// pooling allocator cannot reserve its slots.
    pub fn new(config: &EngineConfig) -> Result<Self, RuntimeError> {
        let mut wasmtime_config = Config::new();

        wasmtime_config.async_support(true);
        wasmtime_config.consume_fuel(config.fuel_metering);
        wasmtime_config.epoch_interruption(config.epoch_interruption);
        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            wasmtime_config.allocation_strategy(InstanceAllocationStrategy::Pooling(
                Self::create_pooling_config(config),
            ));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        if config.epoch_interruption {
            spawn_epoch_ticker(engine.weak(), config.epoch_tick())?;
        }

        info!(
            fuel_metering = config.fuel_metering,
            epoch_interruption = config.epoch_interruption,
            "Wasmtime engine initialized"
        );

        Ok(Self {
            engine,
            config: config.clone(),
        })
    }

    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);
        // Components are never instantiated but the pool still sizes for them.
        pooling.total_component_instances(config.max_instances);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// The underlying Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Advance the epoch by one tick.
    ///
    /// The ticker does this on its own; tests use it to force a yield.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }

    pub fn is_fuel_enabled(&self) -> bool {
        self.config.fuel_metering
    }

    pub fn is_epoch_enabled(&self) -> bool {
        self.config.epoch_interruption
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn spawn_epoch_ticker(engine: EngineWeak, tick: Duration) -> Result<(), RuntimeError> {
    std::thread::Builder::new()
        .name("runnr-epoch".into())
        .spawn(move || {
            loop {
                std::thread::sleep(tick);
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.increment_epoch();
            }
            debug!("epoch ticker stopped");
        })
        .map(|_| ())
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to start epoch ticker: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_config() -> EngineConfig {
        EngineConfig {
            pooling_allocator: false,
            epoch_interruption: false,
            fuel_metering: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_engine_creation() {
        let engine = WasmEngine::new(&plain_config()).unwrap();
        assert!(!engine.is_pooling_enabled());
        assert!(!engine.is_fuel_enabled());
    }

    #[test]
    fn test_engine_with_pooling() {
        let config = EngineConfig {
            pooling_allocator: true,
            max_instances: 8,
            instance_memory_mb: 16,
            ..plain_config()
        };

        let engine = WasmEngine::new(&config).unwrap();
        assert!(engine.is_pooling_enabled());
    }

    #[test]
    fn test_engine_with_epoch_and_fuel() {
        let config = EngineConfig {
            epoch_interruption: true,
            fuel_metering: true,
            ..plain_config()
        };

        let engine = WasmEngine::new(&config).unwrap();
        assert!(engine.is_epoch_enabled());
        assert!(engine.is_fuel_enabled());
        engine.increment_epoch();
    }

    #[test]
    fn test_engine_clone_shares_engine() {
        let engine = WasmEngine::new(&plain_config()).unwrap();
        let clone = engine.clone();
        assert!(Engine::same(engine.inner(), clone.inner()));
    }
}
