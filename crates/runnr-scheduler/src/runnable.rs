//! The [`Runnable`] trait and the per-job [`Ctx`].

use std::future::Future;
use std::sync::{Arc, Weak};

use async_trait::async_trait;

use runnr_common::RuntimeError;
use runnr_host::Capabilities;

use crate::scheduler::SchedulerCore;
use crate::{Job, JobResult, Output};

/// Lifecycle events delivered to a Runnable as its worker grows and shrinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A work thread is about to start.
    Start,
    /// A work thread has stopped.
    Stop,
}

/// A job handler.
///
/// `on_change` lets a Runnable provision per-thread resources; the Wasm
/// runner adds an instance to its pool on `Start` and removes one on `Stop`.
#[async_trait]
pub trait Runnable: Send + Sync + 'static {
    /// Handle one job.
    async fn run(&self, job: Job, ctx: Ctx) -> Result<Output, RuntimeError>;

    /// React to a work thread starting or stopping.
    async fn on_change(&self, _event: ChangeEvent) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// Context handed to a Runnable for one job.
#[derive(Debug, Clone)]
pub struct Ctx {
    capabilities: Capabilities,
    core: Weak<SchedulerCore>,
}

impl Ctx {
    pub(crate) fn new(capabilities: Capabilities, core: Weak<SchedulerCore>) -> Self {
        Self { capabilities, core }
    }

    /// A context that is not attached to any scheduler. `do_job` always fails.
    pub fn detached(capabilities: Capabilities) -> Self {
        Self::new(capabilities, Weak::new())
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn capabilities_mut(&mut self) -> &mut Capabilities {
        &mut self.capabilities
    }

    /// Schedule another job from inside a Runnable.
    ///
    /// A job without its own capabilities runs with a copy of the caller's.
    pub fn do_job(&self, mut job: Job) -> JobResult {
        if job.capabilities.is_none() {
            job.capabilities = Some(self.capabilities.for_job());
        }

        match self.core.upgrade() {
            Some(core) => core.do_job(job),
            None => {
                let err = RuntimeError::WorkerStopped {
                    job_type: job.job_type().to_string(),
                };
                JobResult::ready(job.uuid(), Err(err))
            }
        }
    }
}

/// A Runnable backed by an async closure.
pub struct FnRunnable<F> {
    f: F,
}

/// Wrap an async closure as a [`Runnable`].
pub fn runnable_fn<F, Fut>(f: F) -> Arc<FnRunnable<F>>
where
    F: Fn(Job, Ctx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Output, RuntimeError>> + Send + 'static,
{
    Arc::new(FnRunnable { f })
}

#[async_trait]
impl<F, Fut> Runnable for FnRunnable<F>
where
    F: Fn(Job, Ctx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Output, RuntimeError>> + Send + 'static,
{
    async fn run(&self, job: Job, ctx: Ctx) -> Result<Output, RuntimeError> {
        (self.f)(job, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_runnable() {
        let runnable = runnable_fn(|job: Job, _ctx| async move {
            let input = job.bytes()?;
            Ok(Output::Bytes([b"Hello, ".as_slice(), &input].concat()))
        });

        let ctx = Ctx::detached(Capabilities::default());
        let out = runnable.run(Job::new("echo", "world"), ctx).await.unwrap();
        assert_eq!(out.into_bytes().unwrap(), b"Hello, world");
        assert!(runnable.on_change(ChangeEvent::Start).await.is_ok());
    }

    #[tokio::test]
    async fn test_detached_do_job_fails() {
        let ctx = Ctx::detached(Capabilities::default());
        let err = ctx.do_job(Job::new("other", "x")).then().await.unwrap_err();
        assert!(err.is_scheduling());
    }
}
