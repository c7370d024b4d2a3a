//! Job scheduling for runnr.
//!
//! This crate multiplexes jobs across pools of Runnables:
//!
//! - [`Scheduler`]: registers Runnables per job type and routes jobs to them
//! - [`Worker`]: one per job type; a bounded queue plus a pool of work threads
//! - [`autoscaler`]: grows and shrinks worker pools from queue depth and arrival rate
//! - [`JobResult`] / [`Group`]: single-shot results with forwarding
//! - [`Schedule`]: recurring ([`Every`]) and delayed ([`After`]) jobs
//!
//! # Example
//!
//! ```no_run
//! use runnr_common::WorkerOptions;
//! use runnr_scheduler::{Ctx, Job, Output, Scheduler, runnable_fn};
//!
//! # async fn example() -> Result<(), runnr_common::RuntimeError> {
//! let scheduler = Scheduler::new();
//! scheduler.register(
//!     "hello",
//!     runnable_fn(|job: Job, _ctx: Ctx| async move {
//!         let name = String::from_utf8_lossy(&job.bytes()?).to_string();
//!         Ok(Output::Text(format!("Hello, {name}")))
//!     }),
//!     WorkerOptions::default().autoscale(4),
//! );
//!
//! let output = scheduler.do_job(Job::new("hello", "world")).then().await?;
//! assert_eq!(output.into_bytes()?, b"Hello, world");
//! # Ok(())
//! # }
//! ```

pub mod autoscaler;
pub mod job;
pub mod result;
pub mod runnable;
pub mod schedule;
pub mod scheduler;
mod thread;
pub mod worker;

pub use autoscaler::ScaleDecision;
pub use job::{Job, Payload};
pub use result::{Group, JobResult, Output, ResultSender};
pub use runnable::{ChangeEvent, Ctx, FnRunnable, Runnable, runnable_fn};
pub use schedule::{After, Every, Schedule};
pub use scheduler::{ScalerMetrics, Scheduler};
pub use worker::{Worker, WorkerMetrics};
