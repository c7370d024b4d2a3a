//! The Wasm [`Runnable`].
//!
//! [`WasmRunner`] turns a job into guest input, runs it on an instance from
//! its [`WasmEnvironment`], and turns the guest's output back into an
//! [`Output`]. Request-shaped jobs are bound to the job's request handler,
//! run on the request body, and answered with a [`CoordinatedResponse`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, instrument};

use runnr_common::{CoordinatedResponse, ExecutionConfig, RuntimeError};
use runnr_scheduler::{ChangeEvent, Ctx, Job, Output, Runnable};

use crate::{ModuleRef, WasmEngine, WasmEnvironment};

/// Runs jobs on a pool of instances of one module.
#[derive(Debug, Clone)]
pub struct WasmRunner {
    env: WasmEnvironment,
}

impl WasmRunner {
    pub fn new(env: WasmEnvironment) -> Self {
        Self { env }
    }

    /// A runner with a fresh environment for `module_ref`.
    pub fn from_ref(module_ref: ModuleRef, engine: WasmEngine, execution: ExecutionConfig) -> Self {
        Self::new(WasmEnvironment::new(module_ref, engine, execution))
    }

    pub fn environment(&self) -> &WasmEnvironment {
        &self.env
    }
}

#[async_trait]
impl Runnable for WasmRunner {
    #[instrument(skip_all, fields(module = %self.env.module_ref().name(), job = %job.uuid()))]
    async fn run(&self, job: Job, mut ctx: Ctx) -> Result<Output, RuntimeError> {
        let request = job.payload().as_request().map(|r| Arc::new(Mutex::new(r)));

        let input = match &request {
            Some(request) => {
                ctx.capabilities_mut().request_handler.bind(request.clone());
                request.lock().body.clone()
            }
            None => job.bytes()?,
        };

        let capabilities = ctx.capabilities().clone();
        let output = self
            .env
            .use_instance(capabilities, move |instance, ident| {
                async move { instance.execute(&input, ident).await }.boxed()
            })
            .await??;

        let Some(request) = request else {
            return Ok(Output::Bytes(output));
        };

        debug!(output_len = output.len(), "wrapping request response");
        let response = CoordinatedResponse {
            output,
            resp_headers: request.lock().resp_headers.clone(),
        };
        Ok(Output::Bytes(response.to_json()?))
    }

    async fn on_change(&self, event: ChangeEvent) -> Result<(), RuntimeError> {
        match event {
            ChangeEvent::Start => self.env.add_instance().await,
            ChangeEvent::Stop => {
                self.env.remove_instance().await;
                Ok(())
            }
        }
    }
}
