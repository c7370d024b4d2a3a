//! Store state for Runnable instances.
//!
//! Every instance lives in its own [`Store`] whose data is an
//! [`InstanceState`]: the WASI preview1 context, the memory limiter and the
//! [`InstanceSlot`] host functions use to reach the current job.

use std::sync::Arc;

use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::preview1::WasiP1Ctx;

use runnr_common::{ExecutionConfig, RuntimeError};

use crate::WasmEngine;
use crate::ffi::InstanceSlot;

/// Host-side data of one instance's store.
pub struct InstanceState {
    wasi: WasiP1Ctx,
    slot: Arc<InstanceSlot>,
    limits: StoreLimits,
}

impl InstanceState {
    fn new(execution: &ExecutionConfig) -> Self {
        let wasi = WasiCtxBuilder::new()
            .inherit_stdout()
            .inherit_stderr()
            .build_p1();

        let limits = StoreLimitsBuilder::new()
            .memory_size(execution.max_memory_bytes())
            .instances(1)
            .build();

        Self {
            wasi,
            slot: Arc::new(InstanceSlot::new()),
            limits,
        }
    }

    pub fn slot(&self) -> &Arc<InstanceSlot> {
        &self.slot
    }

    pub fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }
}

impl std::fmt::Debug for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceState")
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

/// Create a store for one instance.
///
/// Guests yield to the executor on every epoch tick when epoch interruption
/// is enabled; fuel, when metered, is topped up per job by [`refuel`].
///
/// # Errors
///
/// Returns an error if the initial fuel cannot be set.
pub fn create_store(
    engine: &WasmEngine,
    execution: &ExecutionConfig,
) -> Result<Store<InstanceState>, RuntimeError> {
    let mut store = Store::new(engine.inner(), InstanceState::new(execution));
    store.limiter(|state| &mut state.limits);

    if engine.is_epoch_enabled() {
        store.epoch_deadline_async_yield_and_update(1);
    }
    if engine.is_fuel_enabled() {
        refuel(&mut store, execution.max_fuel)?;
    }

    Ok(store)
}

/// Reset the store's fuel to `fuel`.
///
/// # Errors
///
/// Returns an error if fuel metering is not enabled on the engine.
pub fn refuel(store: &mut Store<InstanceState>, fuel: u64) -> Result<(), RuntimeError> {
    store
        .set_fuel(fuel)
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))
}

/// Fuel left in the store, if metering is enabled.
pub fn remaining_fuel(store: &Store<InstanceState>) -> Option<u64> {
    store.get_fuel().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use runnr_common::EngineConfig;

    #[test]
    fn test_create_store_with_fuel() {
        let engine = WasmEngine::new(&EngineConfig {
            fuel_metering: true,
            epoch_interruption: false,
            ..Default::default()
        })
        .unwrap();
        let execution = ExecutionConfig {
            max_fuel: 5_000,
            ..Default::default()
        };

        let mut store = create_store(&engine, &execution).unwrap();
        assert_eq!(remaining_fuel(&store), Some(5_000));

        refuel(&mut store, 10).unwrap();
        assert_eq!(remaining_fuel(&store), Some(10));
    }

    #[test]
    fn test_create_store_without_fuel() {
        let engine = WasmEngine::new(&EngineConfig {
            fuel_metering: false,
            epoch_interruption: false,
            ..Default::default()
        })
        .unwrap();

        let mut store = create_store(&engine, &ExecutionConfig::default()).unwrap();
        assert_eq!(remaining_fuel(&store), None);
        assert!(refuel(&mut store, 10).is_err());
        assert!(store.data().slot().capabilities().is_none());
    }
}
