//! Job state machine types and per-operation options.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Queue jobs land on when no queue is named.
pub const DEFAULT_QUEUE: &str = "default";

/// Lifecycle state of a job.
///
/// `Finished` and `Failed` are terminal except through an explicit retry,
/// which returns the row to `Inactive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting to be dispatched.
    Inactive,
    /// Claimed by a worker and running.
    Active,
    /// Terminal failure, possibly awaiting retry.
    Failed,
    /// Terminal success.
    Finished,
}

impl JobState {
    /// Storage representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Finished => "finished",
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "inactive" => Ok(Self::Inactive),
            "active" => Ok(Self::Active),
            "failed" => Ok(Self::Failed),
            "finished" => Ok(Self::Finished),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options accepted by [`Queue::enqueue`](crate::Queue::enqueue).
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Total attempts budget for the job, at least 1.
    pub attempts: u32,
    /// How long the job stays ineligible after insertion.
    pub delay: Duration,
    /// Discard the job if it is still waiting when this much time has passed.
    pub expire: Option<Duration>,
    /// Allow the job to run even when one of its parents failed.
    pub lax: bool,
    /// Initial notes map.
    pub notes: Map<String, Value>,
    /// Jobs that must reach a terminal state before this one runs.
    pub parents: Vec<i64>,
    /// Dispatch priority; larger runs first.
    pub priority: i32,
    /// Named queue to place the job on.
    pub queue: String,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            attempts: 1,
            delay: Duration::ZERO,
            expire: None,
            lax: false,
            notes: Map::new(),
            parents: Vec::new(),
            priority: 0,
            queue: DEFAULT_QUEUE.to_string(),
        }
    }
}

/// Options accepted by [`Queue::retry_job`](crate::Queue::retry_job).
///
/// `None` keeps the stored value; `delay` alone defaults to zero, making the
/// job immediately eligible again.
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    /// Replace the total attempts budget.
    pub attempts: Option<u32>,
    /// How long the job stays ineligible after the retry.
    pub delay: Option<Duration>,
    /// Replace the expiry offset, measured from the retry.
    pub expire: Option<Duration>,
    /// Replace the lax dependency flag.
    pub lax: Option<bool>,
    /// Replace the parent list.
    pub parents: Option<Vec<i64>>,
    /// Replace the dispatch priority.
    pub priority: Option<i32>,
    /// Move the job to another queue.
    pub queue: Option<String>,
}

/// Options accepted by [`Queue::dequeue`](crate::Queue::dequeue).
#[derive(Debug, Clone)]
pub struct DequeueOptions {
    /// Only consider this job id.
    pub id: Option<i64>,
    /// Queues to pull from.
    pub queues: Vec<String>,
    /// Tasks the calling process can execute. An empty list means no task
    /// restriction; a worker runner passes its registered task names here.
    pub tasks: Vec<String>,
}

impl Default for DequeueOptions {
    fn default() -> Self {
        Self {
            id: None,
            queues: vec![DEFAULT_QUEUE.to_string()],
            tasks: Vec::new(),
        }
    }
}

/// Job handed to a worker by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DequeuedJob {
    /// Job id.
    pub id: i64,
    /// Task arguments as enqueued.
    pub args: Value,
    /// Times this job has been retried so far; completion calls must echo
    /// this back.
    pub retries: u32,
    /// Task name to execute.
    pub task: String,
}

/// Full description of a stored job, as returned by listings.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    /// Job id.
    pub id: i64,
    /// Task arguments.
    pub args: Value,
    /// Total attempts budget.
    pub attempts: u32,
    /// Ids of jobs that depend on this one.
    pub children: Vec<i64>,
    /// Insertion time.
    pub created: DateTime<Utc>,
    /// Time the job becomes eligible for dispatch.
    pub delayed: DateTime<Utc>,
    /// Time an inactive job is discarded, if set.
    pub expires: Option<DateTime<Utc>>,
    /// Time the job reached a terminal state.
    pub finished: Option<DateTime<Utc>>,
    /// Whether the job may run after a parent failed.
    pub lax: bool,
    /// Notes map, merge-updated by tasks.
    pub notes: Map<String, Value>,
    /// Ids of jobs this one depends on.
    pub parents: Vec<i64>,
    /// Dispatch priority.
    pub priority: i32,
    /// Queue the job is on.
    pub queue: String,
    /// Result payload, or a short failure description.
    pub result: Option<Value>,
    /// Time of the most recent retry.
    pub retried: Option<DateTime<Utc>>,
    /// Times the job has been re-enqueued.
    pub retries: u32,
    /// Time the current or last attempt started.
    pub started: Option<DateTime<Utc>>,
    /// Lifecycle state.
    pub state: JobState,
    /// Task name.
    pub task: String,
    /// Id of the owning worker while active.
    pub worker: Option<i64>,
}

/// One page of jobs plus the total count matching the filter.
#[derive(Debug, Clone, Serialize)]
pub struct JobList {
    /// Jobs on this page, newest first.
    pub jobs: Vec<JobInfo>,
    /// Jobs matching the filter before pagination.
    pub total: i64,
}

/// Filters accepted by [`Queue::list_jobs`](crate::Queue::list_jobs).
///
/// Empty lists place no restriction.
#[derive(Debug, Clone, Default)]
pub struct ListJobsOptions {
    /// Only jobs with ids strictly below this one.
    pub before: Option<i64>,
    /// Only these job ids.
    pub ids: Vec<i64>,
    /// Only jobs on these queues.
    pub queues: Vec<String>,
    /// Only jobs in these states.
    pub states: Vec<JobState>,
    /// Only jobs for these tasks.
    pub tasks: Vec<String>,
}
