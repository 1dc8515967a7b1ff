#![warn(missing_docs)]
//! Durable background-job queue backed by a single SQLite file.
//!
//! Every producer and worker process embeds this crate and opens its own
//! [`Queue`] handle on the shared database file. The file is the only
//! source of truth and the only synchronization primitive: dispatch claims
//! a job in a single atomic statement, so each job runs on at most one
//! worker at a time even across crashes and arbitrary concurrency. Failed
//! jobs retry with exponential backoff while their attempts budget lasts,
//! jobs can depend on parent jobs, named counted locks serialize outside
//! work, and a periodic [`repair`](Queue::repair) sweep cleans up after
//! dead workers.
//!
//! ```no_run
//! use drudge::{DequeueOptions, EnqueueOptions, Queue, RegisterOptions};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn demo() -> drudge::Result<()> {
//! let queue = Queue::connect("jobs.db").await?;
//!
//! // Producer side.
//! queue
//!     .enqueue("send_mail", json!(["user@example.com"]), &EnqueueOptions::default())
//!     .await?;
//!
//! // Worker side.
//! let worker = queue.register_worker(None, &RegisterOptions::default()).await?;
//! while let Some(job) = queue
//!     .dequeue(worker, Duration::from_secs(5), &DequeueOptions::default())
//!     .await?
//! {
//!     // ... execute the task, then:
//!     queue.finish_job(job.id, job.retries, json!("delivered")).await?;
//! }
//! queue.unregister_worker(worker).await?;
//! # Ok(())
//! # }
//! ```

mod codec;
mod migrations;

pub mod config;
pub mod error;
pub mod job;
pub mod queue;

pub use config::{default_backoff, BackoffFn, QueueConfig};
pub use error::{QueueError, Result};
pub use job::{
    DequeueOptions, DequeuedJob, EnqueueOptions, JobInfo, JobList, JobState, ListJobsOptions,
    RetryOptions, DEFAULT_QUEUE,
};
pub use queue::locks::{ListLocksOptions, LockInfo, LockList, LockOptions};
pub use queue::registry::{Command, ListWorkersOptions, RegisterOptions, WorkerInfo, WorkerList};
pub use queue::report::{DailyBucket, History, Stats};
pub use queue::{Queue, ResetOptions, FOREGROUND_QUEUE};
