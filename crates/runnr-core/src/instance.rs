//! A single Runnable instance.
//!
//! [`WasmInstance`] owns one store and one instantiated module. It marshals
//! job input into guest memory through the guest's `allocate`/`deallocate`
//! exports, calls `run_e`, and collects the outcome the guest published
//! through `return_result` or `return_error`.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, instrument, warn};
use wasmtime::{Linker, Memory, Store, Trap, TypedFunc};
use wasmtime_wasi::I32Exit;

use runnr_common::{ExecutionConfig, RunErr, RuntimeError};

use crate::ffi::InstanceSlot;
use crate::store::{InstanceState, create_store, refuel, remaining_fuel};
use crate::{CompiledModule, WasmEngine, memory};

/// Guest entry point, called as `run_e(ptr, len, ident)`.
pub const RUN_EXPORT: &str = "run_e";

/// One live guest VM.
pub struct WasmInstance {
    store: Store<InstanceState>,
    memory: Memory,
    allocate: TypedFunc<i32, i32>,
    deallocate: TypedFunc<(i32, i32), ()>,
    run_e: Option<TypedFunc<(i32, i32, i32), ()>>,
    max_fuel: Option<u64>,
}

impl WasmInstance {
    /// Instantiate `module` and run its start hooks.
    ///
    /// `_start` (or `wasi_start`) runs first, then `init`. A WASI `_start`
    /// that exits with status 0 counts as success.
    ///
    /// # Errors
    ///
    /// Fails if the module lacks the ABI exports, instantiation fails, or a
    /// start hook traps.
    #[instrument(skip_all, fields(content_hash = %module.content_hash()))]
    pub async fn new(
        engine: &WasmEngine,
        linker: &Linker<InstanceState>,
        module: &CompiledModule,
        execution: &ExecutionConfig,
    ) -> Result<Self, RuntimeError> {
        module.check_abi_exports()?;

        let mut store = create_store(engine, execution)?;
        let instance = linker
            .instantiate_async(&mut store, module.module())
            .await
            .map_err(|e| RuntimeError::instantiation(format!("{e:#}")))?;

        let memory = instance
            .get_memory(&mut store, memory::MEMORY_EXPORT)
            .ok_or_else(|| RuntimeError::MissingExport {
                name: memory::MEMORY_EXPORT.into(),
            })?;
        let allocate = instance
            .get_typed_func::<i32, i32>(&mut store, "allocate")
            .map_err(|e| RuntimeError::instantiation(format!("allocate: {e}")))?;
        let deallocate = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, "deallocate")
            .map_err(|e| RuntimeError::instantiation(format!("deallocate: {e}")))?;
        let run_e = instance
            .get_typed_func::<(i32, i32, i32), ()>(&mut store, RUN_EXPORT)
            .ok();

        for name in ["_start", "wasi_start"] {
            if let Ok(start) = instance.get_typed_func::<(), ()>(&mut store, name) {
                match start.call_async(&mut store, ()).await {
                    Ok(()) => {}
                    Err(e) if e.downcast_ref::<I32Exit>().is_some_and(|exit| exit.0 == 0) => {}
                    Err(e) => {
                        return Err(RuntimeError::instantiation(format!("{name} failed: {e:#}")));
                    }
                }
                break;
            }
        }

        if let Ok(init) = instance.get_typed_func::<(), ()>(&mut store, "init") {
            init.call_async(&mut store, ())
                .await
                .map_err(|e| RuntimeError::instantiation(format!("init failed: {e:#}")))?;
        }

        debug!(has_run_e = run_e.is_some(), "instance ready");

        Ok(Self {
            store,
            memory,
            allocate,
            deallocate,
            run_e,
            max_fuel: engine.is_fuel_enabled().then_some(execution.max_fuel),
        })
    }

    pub(crate) fn slot(&self) -> &Arc<InstanceSlot> {
        self.store.data().slot()
    }

    /// Copy `len` bytes out of guest memory.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::MemoryAccess`] for out-of-bounds ranges.
    pub fn read_memory(&self, ptr: i32, len: i32) -> Result<Vec<u8>, RuntimeError> {
        memory::read(self.memory, &self.store, ptr, len)
    }

    /// Allocate guest memory for `bytes` with the guest's `allocate`, copy
    /// them in and return the pointer.
    ///
    /// The allocation is handed back to `deallocate` if the copy fails.
    ///
    /// # Errors
    ///
    /// Fails if `allocate` traps or returns a pointer that cannot hold `bytes`.
    pub async fn write_memory(&mut self, bytes: &[u8]) -> Result<i32, RuntimeError> {
        let len = i32::try_from(bytes.len()).map_err(|_| RuntimeError::MemoryAccess {
            ptr: 0,
            len: i32::MAX,
        })?;

        let ptr = self
            .allocate
            .call_async(&mut self.store, len)
            .await
            .map_err(|e| trap_error("allocate", &e))?;

        if let Err(e) = self.write_memory_at(ptr, bytes) {
            if let Err(free_err) = self.deallocate(ptr, len).await {
                warn!(ptr, len, error = %free_err, "failed to free unwritable allocation");
            }
            return Err(e);
        }
        Ok(ptr)
    }

    /// Copy `bytes` into space the guest already allocated.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::MemoryAccess`] for out-of-bounds ranges.
    pub fn write_memory_at(&mut self, ptr: i32, bytes: &[u8]) -> Result<(), RuntimeError> {
        memory::write(self.memory, &mut self.store, ptr, bytes)
    }

    /// Free guest memory with the guest's `deallocate`.
    ///
    /// # Errors
    ///
    /// Fails if `deallocate` traps.
    pub async fn deallocate(&mut self, ptr: i32, len: i32) -> Result<(), RuntimeError> {
        self.deallocate
            .call_async(&mut self.store, (ptr, len))
            .await
            .map_err(|e| trap_error("deallocate", &e))
    }

    /// Run one job: write `input`, call `run_e(ptr, len, ident)`, collect
    /// the outcome and free the input buffer.
    ///
    /// An error published with `return_error` (or `return_abort`) wins over
    /// a trap, so a guest that aborts and then traps reports its abort. A
    /// trap with nothing published becomes `RunErr { code: -1 }`. A call
    /// that publishes nothing succeeds with empty output.
    ///
    /// # Errors
    ///
    /// Returns the guest's error, [`RuntimeError::FuelExhausted`], or a
    /// missing `run_e` export.
    #[instrument(skip(self, input), fields(input_len = input.len()))]
    pub async fn execute(&mut self, input: &[u8], ident: i32) -> Result<Vec<u8>, RuntimeError> {
        let run_e = self.run_e.clone().ok_or_else(RuntimeError::missing_run_e)?;

        if let Some(fuel) = self.max_fuel {
            refuel(&mut self.store, fuel)?;
        }

        let start = Instant::now();
        let ptr = self.write_memory(input).await?;
        let len = i32::try_from(input.len()).unwrap_or(i32::MAX);

        let call = run_e.call_async(&mut self.store, (ptr, len, ident)).await;
        let outcome = self.slot().take_outcome();

        if let Err(e) = self.deallocate(ptr, len).await {
            warn!(error = %e, "failed to free job input");
        }

        let fuel_left = remaining_fuel(&self.store);
        debug!(
            duration_ms = start.elapsed().as_millis(),
            fuel_left = ?fuel_left,
            "run_e returned"
        );

        match (outcome, call) {
            (Some(Err(run_err)), _) => Err(run_err.into()),
            (_, Err(e)) if is_out_of_fuel(&e) => {
                warn!("Execution terminated: fuel exhausted");
                Err(RuntimeError::FuelExhausted)
            }
            (_, Err(e)) => {
                error!(trap = %e, "run_e trapped");
                Err(RunErr::new(-1, format!("{e:#}")).into())
            }
            (Some(Ok(output)), Ok(())) => Ok(output),
            (None, Ok(())) => Ok(Vec::new()),
        }
    }
}

impl std::fmt::Debug for WasmInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmInstance")
            .field("slot", self.slot())
            .field("has_run_e", &self.run_e.is_some())
            .finish_non_exhaustive()
    }
}

fn is_out_of_fuel(error: &wasmtime::Error) -> bool {
    error
        .downcast_ref::<Trap>()
        .is_some_and(|trap| *trap == Trap::OutOfFuel)
}

fn trap_error(func: &str, error: &wasmtime::Error) -> RuntimeError {
    if is_out_of_fuel(error) {
        return RuntimeError::FuelExhausted;
    }
    RuntimeError::trap(format!("{func}: {error:#}"))
}
