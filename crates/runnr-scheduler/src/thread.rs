//! Work threads: the consumers of a worker's queue.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use runnr_common::RuntimeError;

use crate::scheduler::SchedulerCore;
use crate::{Ctx, Job, ResultSender, Runnable};

/// A job waiting in a worker's queue together with its result sender.
#[derive(Debug)]
pub(crate) struct QueuedJob {
    pub job: Job,
    pub sender: ResultSender,
}

pub(crate) type SharedReceiver = Arc<Mutex<mpsc::Receiver<QueuedJob>>>;

/// One task consuming jobs for a worker, running at most one job at a time.
#[derive(Debug)]
pub(crate) struct WorkThread {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl WorkThread {
    pub fn spawn(
        job_type: String,
        runner: Arc<dyn Runnable>,
        queue: SharedReceiver,
        timeout: Option<Duration>,
        core: Weak<SchedulerCore>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    next = async { queue.lock().await.recv().await } => next,
                };

                let Some(QueuedJob { job, sender }) = next else {
                    break;
                };

                let span = info_span!("job", job_type = %job_type, uuid = %job.uuid());
                let outcome = run_job(runner.as_ref(), job, timeout, &core)
                    .instrument(span)
                    .await;
                sender.send(outcome);
            }
            debug!(job_type = %job_type, "work thread exited");
        });

        Self { cancel, handle }
    }

    /// Cancel the thread and wait for it to finish its current job.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "work thread ended abnormally");
        }
    }
}

async fn run_job(
    runner: &dyn Runnable,
    mut job: Job,
    timeout: Option<Duration>,
    core: &Weak<SchedulerCore>,
) -> Result<crate::Output, RuntimeError> {
    let capabilities = job.capabilities.take().unwrap_or_default();
    let ctx = Ctx::new(capabilities, core.clone());

    // Dropping the run future on timeout cancels the Runnable at its next await point.
    let run = AssertUnwindSafe(runner.run(job, ctx)).catch_unwind();
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_secs = limit.as_secs(), "job timed out");
                return Err(RuntimeError::JobTimeout {
                    seconds: limit.as_secs(),
                });
            }
        },
        None => run.await,
    };

    result.unwrap_or_else(|_| Err(RuntimeError::trap("runnable panicked")))
}
