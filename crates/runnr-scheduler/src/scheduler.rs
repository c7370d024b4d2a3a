//! The scheduler facade.
//!
//! [`Scheduler`] routes jobs to per-job-type [`Worker`]s, owns the autoscaler
//! and the schedule watcher, and hands Runnables a [`crate::Ctx`] that can
//! re-enter it. An alias routes to the worker of another job type, so one
//! Runnable reachable under two names still has a single pool.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use runnr_common::{RuntimeError, WorkerOptions};
use runnr_host::Capabilities;

use crate::schedule::{self, Schedules};
use crate::worker::WorkerMetrics;
use crate::{Job, JobResult, Payload, Runnable, Schedule, Worker, autoscaler};

/// Metrics across all workers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalerMetrics {
    pub total_thread_count: usize,
    pub total_job_count: usize,
    pub workers: HashMap<String, WorkerMetrics>,
}

/// State shared between the scheduler, its workers and job contexts.
#[derive(Debug)]
pub(crate) struct SchedulerCore {
    workers: Arc<DashMap<String, Arc<Worker>>>,
    /// Alias to registered job type.
    aliases: DashMap<String, String>,
}

impl SchedulerCore {
    fn worker_for(&self, name: &str) -> Option<Arc<Worker>> {
        if let Some(worker) = self.workers.get(name) {
            return Some(worker.value().clone());
        }
        let job_type = self.aliases.get(name)?.value().clone();
        self.workers.get(&job_type).map(|w| w.value().clone())
    }

    pub(crate) fn do_job(&self, job: Job) -> JobResult {
        let (sender, result) = JobResult::pair(job.uuid());

        let Some(worker) = self.worker_for(job.job_type()) else {
            warn!(job_type = %job.job_type(), "no worker registered for job type");
            sender.send_error(RuntimeError::UnknownJobType {
                job_type: job.job_type().to_string(),
            });
            return result;
        };

        tokio::spawn(async move {
            if let Err(e) = worker.start().await {
                warn!(job_type = %worker.job_type(), error = %e, "worker failed to start");
            }
            worker.schedule(job, sender).await;
        });

        result
    }
}

/// Routes jobs to registered Runnables.
///
/// Must be created and used inside a Tokio runtime.
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    default_caps: Capabilities,
    schedules: Schedules,
    cancel: CancellationToken,
    autoscaler: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// A scheduler whose workers default to [`Capabilities::default_enabled`].
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::default_enabled())
    }

    /// A scheduler whose workers default to `capabilities`.
    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            core: Arc::new(SchedulerCore {
                workers: Arc::new(DashMap::new()),
                aliases: DashMap::new(),
            }),
            default_caps: capabilities,
            schedules: Arc::new(Mutex::new(Vec::new())),
            cancel: CancellationToken::new(),
            autoscaler: Mutex::new(None),
            watcher: Mutex::new(None),
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.default_caps
    }

    /// Register a Runnable for `job_type` with the scheduler's default capabilities.
    ///
    /// Replaces (and stops) any worker already registered for the job type.
    pub fn register(
        &self,
        job_type: impl Into<String>,
        runnable: Arc<dyn Runnable>,
        options: WorkerOptions,
    ) {
        self.register_with_capabilities(job_type, runnable, self.default_caps.clone(), options);
    }

    /// Register a Runnable whose jobs default to `capabilities`.
    pub fn register_with_capabilities(
        &self,
        job_type: impl Into<String>,
        runnable: Arc<dyn Runnable>,
        capabilities: Capabilities,
        options: WorkerOptions,
    ) {
        let job_type = job_type.into();
        let pre_warm = options.pre_warm;

        info!(
            job_type = %job_type,
            pool_size = options.pool_size,
            autoscale_max = options.max_threads(),
            "registering runnable"
        );

        let worker = Arc::new(Worker::new(
            job_type.clone(),
            runnable,
            capabilities,
            options,
            Arc::downgrade(&self.core),
        ));

        self.core.aliases.remove(&job_type);
        if let Some(previous) = self.core.workers.insert(job_type, worker.clone()) {
            tokio::spawn(async move { previous.stop().await });
        }

        if pre_warm {
            tokio::spawn(async move {
                if let Err(e) = worker.start().await {
                    warn!(job_type = %worker.job_type(), error = %e, "failed to pre-warm worker");
                }
            });
        }

        self.ensure_autoscaler();
    }

    /// Route jobs of type `alias` to the worker registered for `job_type`.
    ///
    /// Returns false, adding nothing, if `job_type` has no worker or `alias`
    /// is itself a registered job type.
    pub fn alias(&self, alias: impl Into<String>, job_type: &str) -> bool {
        let alias = alias.into();
        if !self.core.workers.contains_key(job_type) || self.core.workers.contains_key(&alias) {
            return false;
        }
        debug!(alias = %alias, job_type, "registering alias");
        self.core.aliases.insert(alias, job_type.to_string());
        true
    }

    /// Whether `job_type` names a registered worker or an alias of one.
    pub fn is_registered(&self, job_type: &str) -> bool {
        self.core.worker_for(job_type).is_some()
    }

    /// Registered job types, without aliases.
    pub fn job_types(&self) -> Vec<String> {
        self.core.workers.iter().map(|w| w.key().clone()).collect()
    }

    /// Remove a registration. Returns false if none was registered.
    ///
    /// Removing an alias leaves its worker running. Removing a job type
    /// stops its worker and drops every alias pointing at it.
    pub async fn deregister(&self, job_type: &str) -> bool {
        if self.core.aliases.remove(job_type).is_some() {
            return true;
        }
        let Some((_, worker)) = self.core.workers.remove(job_type) else {
            return false;
        };
        self.core.aliases.retain(|_, target| target != job_type);
        worker.stop().await;
        true
    }

    /// Schedule a job and return its result.
    pub fn do_job(&self, job: Job) -> JobResult {
        self.core.do_job(job)
    }

    /// A closure that schedules payloads as jobs of `job_type`.
    pub fn job_fn(&self, job_type: &str) -> impl Fn(Payload) -> JobResult + use<> {
        let core = self.core.clone();
        let job_type = job_type.to_string();
        move |payload| core.do_job(Job::new(job_type.clone(), payload))
    }

    /// Add a schedule polled once per second.
    pub fn schedule(&self, schedule: impl Schedule + 'static) {
        self.schedules.lock().push(Box::new(schedule));

        let mut watcher = self.watcher.lock();
        if watcher.is_none() {
            *watcher = Some(schedule::spawn_watcher(
                self.schedules.clone(),
                Arc::downgrade(&self.core),
                self.cancel.child_token(),
            ));
        }
    }

    /// Metrics for every worker.
    pub fn metrics(&self) -> ScalerMetrics {
        let mut metrics = ScalerMetrics::default();
        for entry in self.core.workers.iter() {
            let m = entry.value().metrics();
            metrics.total_thread_count += m.thread_count;
            metrics.total_job_count += m.job_count;
            metrics.workers.insert(entry.key().clone(), m);
        }
        metrics
    }

    /// Stop the autoscaler, the watcher and every worker.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let handles = [self.autoscaler.lock().take(), self.watcher.lock().take()];
        for handle in handles.into_iter().flatten() {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        let workers: Vec<Arc<Worker>> = self
            .core
            .workers
            .iter()
            .map(|w| w.value().clone())
            .collect();
        self.core.workers.clear();
        self.core.aliases.clear();

        for worker in workers {
            worker.stop().await;
        }
        info!("scheduler shut down");
    }

    fn ensure_autoscaler(&self) {
        let mut autoscaler = self.autoscaler.lock();
        if autoscaler.is_none() {
            *autoscaler = Some(autoscaler::spawn(
                self.core.workers.clone(),
                self.cancel.child_token(),
            ));
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("job_types", &self.job_types())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Ctx, Output, runnable_fn};

    fn echo() -> Arc<dyn Runnable> {
        runnable_fn(|job: Job, _ctx: Ctx| async move { Ok(Output::Bytes(job.bytes()?)) })
    }

    #[tokio::test]
    async fn test_unknown_job_type() {
        let scheduler = Scheduler::new();
        let err = scheduler.do_job(Job::new("nope", "x")).then().await.unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownJobType { .. }));
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let scheduler = Scheduler::new();
        scheduler.register("echo", echo(), WorkerOptions::default());
        assert!(scheduler.is_registered("echo"));

        let out = scheduler.do_job(Job::new("echo", "hi")).then().await.unwrap();
        assert_eq!(out.into_bytes().unwrap(), b"hi");

        assert!(scheduler.deregister("echo").await);
        assert!(!scheduler.is_registered("echo"));
        assert!(!scheduler.deregister("echo").await);
    }

    #[tokio::test]
    async fn test_alias_shares_one_worker() {
        let scheduler = Scheduler::new();
        scheduler.register("default#echo@v1.0.0", echo(), WorkerOptions::default());

        assert!(scheduler.alias("echo", "default#echo@v1.0.0"));
        assert!(!scheduler.alias("other", "default#missing@v1.0.0"));
        assert!(!scheduler.alias("default#echo@v1.0.0", "default#echo@v1.0.0"));
        assert!(scheduler.is_registered("echo"));
        assert_eq!(scheduler.job_types(), ["default#echo@v1.0.0"]);

        for job_type in ["echo", "default#echo@v1.0.0"] {
            let out = scheduler.do_job(Job::new(job_type, "hi")).then().await.unwrap();
            assert_eq!(out.into_bytes().unwrap(), b"hi");
        }

        let metrics = scheduler.metrics();
        assert_eq!(metrics.workers.len(), 1);
        assert_eq!(metrics.total_thread_count, 1);

        assert!(scheduler.deregister("default#echo@v1.0.0").await);
        assert!(!scheduler.is_registered("echo"));
        assert!(!scheduler.deregister("echo").await);
    }

    #[tokio::test]
    async fn test_deregister_alias_keeps_worker() {
        let scheduler = Scheduler::new();
        scheduler.register("default#echo@v1.0.0", echo(), WorkerOptions::default());
        scheduler.alias("echo", "default#echo@v1.0.0");

        assert!(scheduler.deregister("echo").await);
        assert!(!scheduler.is_registered("echo"));

        let out = scheduler.do_job(Job::new("default#echo@v1.0.0", "x")).then().await.unwrap();
        assert_eq!(out.into_bytes().unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_metrics_serialize() {
        let scheduler = Scheduler::new();
        scheduler.register("echo", echo(), WorkerOptions::default());
        scheduler.do_job(Job::new("echo", "hi")).then().await.unwrap();

        let metrics = scheduler.metrics();
        assert_eq!(metrics.total_thread_count, 1);

        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["workers"]["echo"]["threadCount"], 1);
        assert!(json.get("totalJobCount").is_some());
    }

    #[tokio::test]
    async fn test_job_fn() {
        let scheduler = Scheduler::new();
        scheduler.register("echo", echo(), WorkerOptions::default());

        let echo_job = scheduler.job_fn("echo");
        let out = echo_job("abc".into()).then().await.unwrap();
        assert_eq!(out.into_bytes().unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let scheduler = Scheduler::new();
        scheduler.register("echo", echo(), WorkerOptions::default().with_pool_size(2).pre_warm());
        scheduler.do_job(Job::new("echo", "x")).then().await.unwrap();

        scheduler.shutdown().await;
        assert!(scheduler.job_types().is_empty());
        assert_eq!(scheduler.metrics().total_thread_count, 0);
    }
}
