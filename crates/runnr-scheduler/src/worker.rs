//! Per-job-type workers.
//!
//! A [`Worker`] owns the queue for one job type, a pool of work threads
//! consuming it, and a target thread count. The pool is reconciled towards
//! the target on demand: when a job is scheduled, when the autoscaler moves
//! the target, and when the worker stops.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{debug, error, info, instrument, warn};

use runnr_common::{RuntimeError, WorkerOptions};
use runnr_host::Capabilities;

use crate::scheduler::SchedulerCore;
use crate::thread::{QueuedJob, SharedReceiver, WorkThread};
use crate::{ChangeEvent, Job, ResultSender, Runnable};

/// Point-in-time metrics of one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMetrics {
    pub target_thread_count: usize,
    pub thread_count: usize,
    /// Jobs waiting in the queue.
    pub job_count: usize,
    /// Jobs scheduled per second since the rate was last taken.
    pub job_rate: f64,
}

/// Arrival-rate tracker, reset every time the rate is taken.
#[derive(Debug)]
struct RateTracker {
    inner: Mutex<(u64, Instant)>,
}

impl RateTracker {
    fn new() -> Self {
        Self {
            inner: Mutex::new((0, Instant::now())),
        }
    }

    fn record(&self) {
        self.inner.lock().0 += 1;
    }

    #[allow(clippy::cast_precision_loss)]
    fn rate(count: u64, since: Instant) -> f64 {
        let elapsed = since.elapsed().as_secs_f64();
        if elapsed <= f64::EPSILON {
            0.0
        } else {
            count as f64 / elapsed
        }
    }

    fn peek(&self) -> f64 {
        let (count, since) = *self.inner.lock();
        Self::rate(count, since)
    }

    fn take(&self) -> f64 {
        let mut inner = self.inner.lock();
        let rate = Self::rate(inner.0, inner.1);
        *inner = (0, Instant::now());
        rate
    }
}

/// Executor for one job type.
pub struct Worker {
    job_type: String,
    runner: Arc<dyn Runnable>,
    options: WorkerOptions,
    default_caps: Capabilities,

    tx: mpsc::Sender<QueuedJob>,
    rx: SharedReceiver,

    threads: Mutex<Vec<WorkThread>>,
    target: AtomicUsize,
    reconcile_lock: AsyncMutex<()>,

    started: AtomicBool,
    stopped: AtomicBool,
    rate: RateTracker,

    core: Weak<SchedulerCore>,
}

impl Worker {
    pub(crate) fn new(
        job_type: impl Into<String>,
        runner: Arc<dyn Runnable>,
        default_caps: Capabilities,
        options: WorkerOptions,
        core: Weak<SchedulerCore>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));

        Self {
            job_type: job_type.into(),
            runner,
            target: AtomicUsize::new(options.pool_size.max(1)),
            options,
            default_caps,
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
            threads: Mutex::new(Vec::new()),
            reconcile_lock: AsyncMutex::new(()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            rate: RateTracker::new(),
            core,
        }
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn target_thread_count(&self) -> usize {
        self.target.load(Ordering::Acquire)
    }

    /// Jobs currently waiting in the queue.
    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Metrics without resetting the arrival rate.
    pub fn metrics(&self) -> WorkerMetrics {
        WorkerMetrics {
            target_thread_count: self.target_thread_count(),
            thread_count: self.thread_count(),
            job_count: self.queue_depth(),
            job_rate: self.rate.peek(),
        }
    }

    /// Metrics for a scaling decision; resets the arrival rate.
    pub(crate) fn take_metrics(&self) -> WorkerMetrics {
        WorkerMetrics {
            job_rate: self.rate.take(),
            ..self.metrics()
        }
    }

    /// Move the target. Ignored once the worker is stopped.
    pub(crate) fn set_target(&self, target: usize) {
        if self.is_stopped() {
            return;
        }
        self.target.store(target, Ordering::Release);
    }

    /// The size reconciliation aims for; always 0 after `stop`.
    fn desired_thread_count(&self) -> usize {
        if self.is_stopped() {
            0
        } else {
            self.target_thread_count()
        }
    }

    /// Mark the worker started; with `pre_warm`, fill the pool right away.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!(job_type = %self.job_type, pre_warm = self.options.pre_warm, "starting worker");
        if self.options.pre_warm {
            self.reconcile_pool_size(true).await?;
        }
        Ok(())
    }

    /// Queue a job. Its outcome is delivered through `sender`.
    ///
    /// Waits only when the queue is full.
    #[instrument(skip(self, job, sender), fields(job_type = %self.job_type, uuid = %job.uuid()))]
    pub(crate) async fn schedule(&self, mut job: Job, sender: ResultSender) {
        if self.is_stopped() {
            sender.send_error(self.stopped_error());
            return;
        }

        if job.capabilities.is_none() {
            job.capabilities = Some(self.default_caps.for_job());
        }

        if let Err(e) = self.reconcile_pool_size(false).await {
            if self.thread_count() == 0 {
                error!(error = %e, "no work threads available, failing job");
                sender.send_error(e);
                return;
            }
            warn!(error = %e, "pool is below target");
        }

        self.rate.record();
        if let Err(mpsc::error::SendError(queued)) = self.tx.send(QueuedJob { job, sender }).await
        {
            queued.sender.send_error(self.stopped_error());
        }
    }

    /// Add or remove threads until the pool matches the target.
    ///
    /// At most one reconciliation runs at a time. Unless `wait` is set, a
    /// caller that finds one in flight returns immediately as long as the
    /// pool has at least one thread.
    pub(crate) async fn reconcile_pool_size(&self, wait: bool) -> Result<(), RuntimeError> {
        let _guard = match self.reconcile_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) if !wait && self.thread_count() > 0 => return Ok(()),
            Err(_) => self.reconcile_lock.lock().await,
        };

        loop {
            let target = self.desired_thread_count();
            let actual = self.thread_count();

            if actual < target {
                self.add_thread().await?;
            } else if actual > target {
                self.remove_thread().await;
            } else {
                return Ok(());
            }
        }
    }

    async fn add_thread(&self) -> Result<(), RuntimeError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.runner.on_change(ChangeEvent::Start).await {
                Ok(()) => break,
                Err(e) if attempts > self.options.num_retries => {
                    error!(job_type = %self.job_type, attempts, error = %e, "runnable failed to start");
                    return Err(RuntimeError::PoolStartFailed {
                        job_type: self.job_type.clone(),
                        attempts,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(
                        job_type = %self.job_type,
                        error = %e,
                        retry_secs = self.options.retry_secs,
                        "runnable start failed, will retry"
                    );
                    tokio::time::sleep(self.options.retry_delay()).await;
                }
            }
        }

        let thread = WorkThread::spawn(
            self.job_type.clone(),
            self.runner.clone(),
            self.rx.clone(),
            self.options.job_timeout(),
            self.core.clone(),
        );

        let count = {
            let mut threads = self.threads.lock();
            threads.push(thread);
            threads.len()
        };
        debug!(job_type = %self.job_type, threads = count, "work thread added");
        Ok(())
    }

    async fn remove_thread(&self) {
        let Some(thread) = self.threads.lock().pop() else {
            return;
        };

        thread.stop().await;
        if let Err(e) = self.runner.on_change(ChangeEvent::Stop).await {
            warn!(job_type = %self.job_type, error = %e, "runnable stop hook failed");
        }
        debug!(job_type = %self.job_type, threads = self.thread_count(), "work thread removed");
    }

    /// Stop every thread and fail any job still queued.
    ///
    /// Threads finish the job they are running first.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.target.store(0, Ordering::Release);

        if let Err(e) = self.reconcile_pool_size(true).await {
            warn!(job_type = %self.job_type, error = %e, "error while stopping worker");
        }

        let mut rx = self.rx.lock().await;
        rx.close();
        let mut failed = 0usize;
        while let Ok(queued) = rx.try_recv() {
            queued.sender.send_error(self.stopped_error());
            failed += 1;
        }

        info!(job_type = %self.job_type, failed_queued = failed, "worker stopped");
    }

    fn stopped_error(&self) -> RuntimeError {
        RuntimeError::WorkerStopped {
            job_type: self.job_type.clone(),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("job_type", &self.job_type)
            .field("options", &self.options)
            .field("threads", &self.thread_count())
            .field("target", &self.target_thread_count())
            .finish_non_exhaustive()
    }
}
