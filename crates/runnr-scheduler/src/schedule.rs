//! Recurring and delayed jobs.
//!
//! A [`Schedule`] is polled once per second by the scheduler's watcher and
//! may hand back a job each time. Missed ticks are not made up for; every
//! check produces at most one job. Results of scheduled jobs are discarded.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Job;
use crate::scheduler::SchedulerCore;

pub(crate) const WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// A source of jobs polled at regular intervals.
pub trait Schedule: Send {
    /// A job, if one is due.
    fn check(&mut self) -> Option<Job>;

    /// Whether the schedule has finished and can be dropped.
    fn done(&self) -> bool;
}

type JobFn = Box<dyn FnMut() -> Job + Send>;

/// Produces a job on the first check and then every `seconds`.
pub struct Every {
    every: Duration,
    last: Option<Instant>,
    job_fn: JobFn,
}

impl Every {
    pub fn new(seconds: u64, job_fn: impl FnMut() -> Job + Send + 'static) -> Self {
        Self {
            every: Duration::from_secs(seconds),
            last: None,
            job_fn: Box::new(job_fn),
        }
    }
}

impl Schedule for Every {
    fn check(&mut self) -> Option<Job> {
        let due = self.last.is_none_or(|last| last.elapsed() >= self.every);
        if !due {
            return None;
        }
        self.last = Some(Instant::now());
        Some((self.job_fn)())
    }

    fn done(&self) -> bool {
        false
    }
}

/// Produces one job `seconds` after creation.
pub struct After {
    at: Instant,
    done: bool,
    job_fn: JobFn,
}

impl After {
    pub fn new(seconds: u64, job_fn: impl FnMut() -> Job + Send + 'static) -> Self {
        Self {
            at: Instant::now() + Duration::from_secs(seconds),
            done: false,
            job_fn: Box::new(job_fn),
        }
    }
}

impl Schedule for After {
    fn check(&mut self) -> Option<Job> {
        if self.done || Instant::now() < self.at {
            return None;
        }
        self.done = true;
        Some((self.job_fn)())
    }

    fn done(&self) -> bool {
        self.done
    }
}

pub(crate) type Schedules = Arc<Mutex<Vec<Box<dyn Schedule>>>>;

/// Spawn the watcher that polls `schedules` every second.
pub(crate) fn spawn_watcher(
    schedules: Schedules,
    core: Weak<SchedulerCore>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(WATCH_INTERVAL);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(core) = core.upgrade() else {
                break;
            };

            let due: Vec<Job> = {
                let mut schedules = schedules.lock();
                schedules.retain(|s| !s.done());
                schedules.iter_mut().filter_map(|s| s.check()).collect()
            };

            for job in due {
                debug!(job_type = %job.job_type(), "scheduling job from schedule");
                core.do_job(job).discard();
            }
        }
        debug!("schedule watcher stopped");
    })
}
