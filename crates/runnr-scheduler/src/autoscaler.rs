//! Queue-driven autoscaling of worker pools.
//!
//! Every 500 ms each worker's queue depth `q`, arrival rate `r` and thread
//! count `t` are compared against its bounds:
//!
//! - `q > 2t` or `r > 2t`: double the pool, capped at `autoscale_max`
//! - `q < t/2` and `r < t/2`: halve the pool, floored at `pool_size`
//! - otherwise leave it alone

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::Worker;
use crate::worker::WorkerMetrics;

pub(crate) const SCALE_INTERVAL: Duration = Duration::from_millis(500);

/// Outcome of one scaling evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Up(usize),
    Down(usize),
    Hold,
}

/// Decide the next thread count for a worker.
#[allow(clippy::cast_precision_loss)]
pub fn decide(metrics: &WorkerMetrics, min: usize, max: usize) -> ScaleDecision {
    let t = metrics.thread_count;
    let q = metrics.job_count;
    let r = metrics.job_rate;

    let next = if q > 2 * t || r > (2 * t) as f64 {
        (2 * t).min(max)
    } else if (q as f64) < t as f64 / 2.0 && r < t as f64 / 2.0 {
        (t / 2).max(min)
    } else {
        return ScaleDecision::Hold;
    };

    match next.cmp(&t) {
        std::cmp::Ordering::Greater => ScaleDecision::Up(next),
        std::cmp::Ordering::Less => ScaleDecision::Down(next),
        std::cmp::Ordering::Equal => ScaleDecision::Hold,
    }
}

/// Spawn the autoscaling loop over `workers`. It ends when `cancel` fires.
pub(crate) fn spawn(
    workers: Arc<DashMap<String, Arc<Worker>>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SCALE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let snapshot: Vec<Arc<Worker>> = workers.iter().map(|w| w.value().clone()).collect();
            for worker in snapshot {
                scale(&worker);
            }
        }
        debug!("autoscaler stopped");
    })
}

fn scale(worker: &Arc<Worker>) {
    // A worker with no threads grows on its next job; one that is stopping must not grow.
    if worker.is_stopped() || worker.thread_count() == 0 {
        return;
    }

    let metrics = worker.take_metrics();
    let options = worker.options();
    let decision = decide(&metrics, options.pool_size.max(1), options.max_threads().max(1));

    let next = match decision {
        ScaleDecision::Up(n) | ScaleDecision::Down(n) => n,
        ScaleDecision::Hold => return,
    };

    debug!(
        job_type = %worker.job_type(),
        threads = metrics.thread_count,
        queue_depth = metrics.job_count,
        rate = metrics.job_rate,
        target = next,
        "autoscaling worker"
    );

    worker.set_target(next);
    let worker = worker.clone();
    tokio::spawn(async move {
        if let Err(e) = worker.reconcile_pool_size(true).await {
            warn!(job_type = %worker.job_type(), error = %e, "autoscale reconcile failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(threads: usize, queue: usize, rate: f64) -> WorkerMetrics {
        WorkerMetrics {
            target_thread_count: threads,
            thread_count: threads,
            job_count: queue,
            job_rate: rate,
        }
    }

    #[test]
    fn test_scale_up_on_queue_depth() {
        assert_eq!(decide(&metrics(1, 64, 0.0), 1, 8), ScaleDecision::Up(2));
        assert_eq!(decide(&metrics(4, 64, 0.0), 1, 8), ScaleDecision::Up(8));
        assert_eq!(decide(&metrics(8, 64, 0.0), 1, 8), ScaleDecision::Hold);
        assert_eq!(decide(&metrics(6, 64, 0.0), 1, 8), ScaleDecision::Up(8));
    }

    #[test]
    fn test_scale_up_on_rate() {
        assert_eq!(decide(&metrics(2, 0, 10.0), 1, 8), ScaleDecision::Up(4));
    }

    #[test]
    fn test_scale_down_when_idle() {
        assert_eq!(decide(&metrics(8, 0, 0.0), 1, 8), ScaleDecision::Down(4));
        assert_eq!(decide(&metrics(2, 0, 0.0), 1, 8), ScaleDecision::Down(1));
        assert_eq!(decide(&metrics(1, 0, 0.0), 1, 8), ScaleDecision::Hold);
        assert_eq!(decide(&metrics(4, 0, 0.0), 3, 8), ScaleDecision::Down(3));
    }

    #[test]
    fn test_hold_in_between() {
        assert_eq!(decide(&metrics(4, 4, 4.0), 1, 8), ScaleDecision::Hold);
        // Busy but not growing: half the threads worth of queue keeps the pool.
        assert_eq!(decide(&metrics(4, 2, 0.0), 1, 8), ScaleDecision::Hold);
    }
}
