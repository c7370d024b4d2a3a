//! Wasm environments: one compiled module and its pool of instances.
//!
//! A [`WasmEnvironment`] hands each idle instance to exactly one job at a
//! time. Checking an instance out binds the job's capabilities to it and
//! registers a fresh FFI identifier; returning it undoes both. A job that is
//! abandoned mid-call (its future dropped on timeout) never returns its
//! instance: the instance is discarded and a replacement is built so the
//! pool keeps its size. A replacement still being built counts towards
//! [`WasmEnvironment::instance_count`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, instrument, warn};
use wasmtime::Linker;

use runnr_common::{ExecutionConfig, RuntimeError};
use runnr_host::Capabilities;

use crate::ffi::{self, Registration};
use crate::instance::WasmInstance;
use crate::store::InstanceState;
use crate::{CompiledModule, ModuleRef, WasmEngine, api};

struct Compiled {
    module: CompiledModule,
    linker: Linker<InstanceState>,
}

struct EnvironmentInner {
    module_ref: ModuleRef,
    engine: WasmEngine,
    execution: ExecutionConfig,
    compiled: OnceCell<Compiled>,
    available: Mutex<VecDeque<WasmInstance>>,
    /// One permit per instance in `available`.
    permits: Semaphore,
    /// Live instances plus replacements still being built.
    instances: AtomicUsize,
    replacing: AtomicUsize,
    /// Signalled when a replacement gives up and `instances` drops.
    shrunk: Notify,
}

const REPLACE_ATTEMPTS: u32 = 3;
const REPLACE_BACKOFF: Duration = Duration::from_millis(200);

/// One module and its instance pool. Cheap to clone.
#[derive(Clone)]
pub struct WasmEnvironment {
    inner: Arc<EnvironmentInner>,
}

impl WasmEnvironment {
    /// An environment for `module_ref`. The module is compiled on the first
    /// [`WasmEnvironment::add_instance`].
    pub fn new(module_ref: ModuleRef, engine: WasmEngine, execution: ExecutionConfig) -> Self {
        Self {
            inner: Arc::new(EnvironmentInner {
                module_ref,
                engine,
                execution,
                compiled: OnceCell::new(),
                available: Mutex::new(VecDeque::new()),
                permits: Semaphore::new(0),
                instances: AtomicUsize::new(0),
                replacing: AtomicUsize::new(0),
                shrunk: Notify::new(),
            }),
        }
    }

    pub fn module_ref(&self) -> &ModuleRef {
        &self.inner.module_ref
    }

    /// Instances owned by the environment, idle or in use.
    pub fn instance_count(&self) -> usize {
        self.inner.instances.load(Ordering::SeqCst)
    }

    /// Idle instances.
    pub fn available_count(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Replacements for abandoned instances not yet in the pool.
    pub fn pending_replacements(&self) -> usize {
        self.inner.replacing.load(Ordering::SeqCst)
    }

    fn compiled(&self) -> Result<&Compiled, RuntimeError> {
        self.inner.compiled.get_or_try_init(|| {
            let bytes = self.inner.module_ref.bytes()?;
            let module = CompiledModule::from_source(self.inner.engine.inner(), &bytes)?;
            let linker = api::build_linker(&self.inner.engine)?;
            Ok(Compiled { module, linker })
        })
    }

    /// Instantiate one more instance and make it available.
    ///
    /// # Errors
    ///
    /// Fails if the module cannot be compiled or instantiated.
    #[instrument(skip(self), fields(module = %self.inner.module_ref.name()))]
    pub async fn add_instance(&self) -> Result<(), RuntimeError> {
        let instance = self.instantiate().await?;

        let count = self.inner.instances.fetch_add(1, Ordering::SeqCst) + 1;
        self.release(instance);
        info!(instances = count, "instance added");
        Ok(())
    }

    async fn instantiate(&self) -> Result<WasmInstance, RuntimeError> {
        let compiled = self.compiled()?;
        WasmInstance::new(
            &self.inner.engine,
            &compiled.linker,
            &compiled.module,
            &self.inner.execution,
        )
        .await
    }

    /// Take one idle instance out of the pool and drop it.
    ///
    /// Waits for an instance to become idle, including one still being
    /// built to replace an abandoned call. Returns without removing
    /// anything once the pool is empty.
    pub async fn remove_instance(&self) {
        loop {
            let shrunk = self.inner.shrunk.notified();
            tokio::pin!(shrunk);
            shrunk.as_mut().enable();

            if self.instance_count() == 0 {
                return;
            }

            tokio::select! {
                acquired = self.acquire() => {
                    let Ok(instance) = acquired else {
                        return;
                    };
                    drop(instance);

                    let count = self.inner.instances.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
                    info!(module = %self.inner.module_ref.name(), instances = count, "instance removed");
                    return;
                }
                () = &mut shrunk => {}
            }
        }
    }

    async fn acquire(&self) -> Result<WasmInstance, RuntimeError> {
        let permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|_| RuntimeError::trap("instance pool closed"))?;
        permit.forget();

        self.inner
            .available
            .lock()
            .pop_front()
            .ok_or_else(|| RuntimeError::trap("instance pool out of sync"))
    }

    fn release(&self, instance: WasmInstance) {
        self.inner.available.lock().push_back(instance);
        self.inner.permits.add_permits(1);
    }

    /// Check out an idle instance for a job holding `capabilities`.
    ///
    /// The returned lease carries the FFI identifier registered for the
    /// job. Waits while every instance is in use.
    ///
    /// # Errors
    ///
    /// Fails if the pool is closed.
    pub async fn checkout(&self, capabilities: Capabilities) -> Result<InstanceLease, RuntimeError> {
        let instance = self.acquire().await?;
        instance.slot().bind(capabilities);
        let registration = ffi::register(instance.slot().clone());

        debug!(ident = registration.ident(), "instance checked out");

        Ok(InstanceLease {
            env: self.clone(),
            instance: Some(instance),
            registration: Some(registration),
            completed: false,
        })
    }

    /// Run `f` with an idle instance and its FFI identifier.
    ///
    /// The instance goes back to the pool when `f` finishes, whatever its
    /// result. If this future is dropped before `f` finishes, the instance
    /// is replaced instead.
    ///
    /// # Errors
    ///
    /// Fails if no instance can be checked out.
    pub async fn use_instance<R, F>(&self, capabilities: Capabilities, f: F) -> Result<R, RuntimeError>
    where
        F: for<'a> FnOnce(&'a mut WasmInstance, i32) -> BoxFuture<'a, R>,
    {
        let mut lease = self.checkout(capabilities).await?;
        let ident = lease.ident();
        let output = f(lease.instance_mut()?, ident).await;
        lease.complete();
        Ok(output)
    }

    /// Drop `instance` and build its replacement in the background.
    ///
    /// The instance count is left alone until the replacement either lands
    /// in the pool or gives up after [`REPLACE_ATTEMPTS`].
    fn replace_abandoned(&self, instance: WasmInstance) {
        drop(instance);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("abandoned instance dropped without a runtime to replace it");
            self.shrink();
            return;
        };

        self.inner.replacing.fetch_add(1, Ordering::SeqCst);
        let env = self.clone();
        handle.spawn(async move {
            let module = env.inner.module_ref.name().to_string();
            for attempt in 1..=REPLACE_ATTEMPTS {
                match env.instantiate().await {
                    Ok(instance) => {
                        env.inner.replacing.fetch_sub(1, Ordering::SeqCst);
                        env.release(instance);
                        debug!(%module, attempt, "abandoned instance replaced");
                        return;
                    }
                    Err(e) => {
                        warn!(%module, attempt, error = %e, "failed to replace abandoned instance");
                        if attempt < REPLACE_ATTEMPTS {
                            tokio::time::sleep(REPLACE_BACKOFF * attempt).await;
                        }
                    }
                }
            }

            env.inner.replacing.fetch_sub(1, Ordering::SeqCst);
            env.shrink();
            error!(%module, instances = env.instance_count(), "giving up on replacing abandoned instance");
        });
    }

    fn shrink(&self) {
        self.inner.instances.fetch_sub(1, Ordering::SeqCst);
        self.inner.shrunk.notify_waiters();
    }
}

impl std::fmt::Debug for WasmEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEnvironment")
            .field("module", &self.inner.module_ref.name())
            .field("instances", &self.instance_count())
            .field("available", &self.available_count())
            .field("replacing", &self.pending_replacements())
            .finish_non_exhaustive()
    }
}

/// An instance checked out of a [`WasmEnvironment`].
///
/// Dropping the lease clears the instance's job state and releases its FFI
/// identifier. A completed lease returns the instance to the pool; an
/// incomplete one discards it and schedules a replacement.
pub struct InstanceLease {
    env: WasmEnvironment,
    instance: Option<WasmInstance>,
    registration: Option<Registration>,
    completed: bool,
}

impl InstanceLease {
    pub fn ident(&self) -> i32 {
        self.registration.as_ref().map_or(-1, Registration::ident)
    }

    /// The leased instance.
    ///
    /// # Errors
    ///
    /// Never fails while the lease is alive.
    pub fn instance_mut(&mut self) -> Result<&mut WasmInstance, RuntimeError> {
        self.instance
            .as_mut()
            .ok_or_else(|| RuntimeError::trap("lease has no instance"))
    }

    /// Mark the guest call as finished so the instance is reused.
    pub fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        let Some(instance) = self.instance.take() else {
            return;
        };

        instance.slot().clear();
        drop(self.registration.take());

        if self.completed {
            self.env.release(instance);
        } else {
            warn!(module = %self.env.inner.module_ref.name(), "guest call abandoned, replacing instance");
            self.env.replace_abandoned(instance);
        }
    }
}
