//! Stats, history, and paged listings.

use crate::codec;
use crate::error::Result;
use crate::job::{JobInfo, JobList, JobState, ListJobsOptions};
use crate::queue::locks::{ListLocksOptions, LockInfo, LockList};
use crate::queue::registry::{ListWorkersOptions, WorkerInfo, WorkerList};
use crate::queue::Queue;

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;

/// Aggregated queue counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Stats {
    /// Jobs currently running.
    pub active_jobs: i64,
    /// Jobs waiting to run and not yet expired.
    pub inactive_jobs: i64,
    /// Inactive jobs whose eligibility time is still in the future.
    pub delayed_jobs: i64,
    /// Jobs in terminal failure.
    pub failed_jobs: i64,
    /// Jobs in terminal success.
    pub finished_jobs: i64,
    /// Largest job id ever assigned.
    pub enqueued_jobs: i64,
    /// Workers currently running at least one job.
    pub active_workers: i64,
    /// Registered workers without an active job.
    pub inactive_workers: i64,
    /// Unexpired leases.
    pub active_locks: i64,
    /// Store uptime in seconds. SQLite has no server process, so this is
    /// always zero.
    pub uptime: u64,
}

/// One hourly bucket of terminal transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DailyBucket {
    /// Start of the hour as a Unix timestamp.
    pub epoch: i64,
    /// Jobs that failed during the hour.
    pub failed_jobs: i64,
    /// Jobs that finished during the hour.
    pub finished_jobs: i64,
}

/// Hourly job history for the trailing day.
#[derive(Debug, Clone, Serialize)]
pub struct History {
    /// Exactly 24 buckets, oldest first, one hour apart.
    pub daily: Vec<DailyBucket>,
}

/// Internal row type for job listings.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    args: String,
    attempts: u32,
    children: String,
    created: String,
    delayed: String,
    expires: Option<String>,
    finished: Option<String>,
    lax: bool,
    notes: String,
    parents: String,
    priority: i32,
    queue: String,
    result: Option<String>,
    retried: Option<String>,
    retries: u32,
    started: Option<String>,
    state: String,
    task: String,
    worker: Option<i64>,
}

impl JobRow {
    fn into_info(self) -> Result<JobInfo> {
        Ok(JobInfo {
            id: self.id,
            args: codec::decode(&self.args)?,
            attempts: self.attempts,
            children: codec::decode_ids(&self.children)?,
            created: codec::parse_stamp(&self.created)?,
            delayed: codec::parse_stamp(&self.delayed)?,
            expires: self.expires.as_deref().map(codec::parse_stamp).transpose()?,
            finished: self.finished.as_deref().map(codec::parse_stamp).transpose()?,
            lax: self.lax,
            notes: codec::decode_map(&self.notes)?,
            parents: codec::decode_ids(&self.parents)?,
            priority: self.priority,
            queue: self.queue,
            result: self.result.as_deref().map(codec::decode).transpose()?,
            retried: self.retried.as_deref().map(codec::parse_stamp).transpose()?,
            retries: self.retries,
            started: self.started.as_deref().map(codec::parse_stamp).transpose()?,
            state: JobState::from_str(&self.state).map_err(crate::QueueError::State)?,
            task: self.task,
            worker: self.worker,
        })
    }
}

/// Internal row type for worker listings.
#[derive(sqlx::FromRow)]
struct WorkerRow {
    id: i64,
    host: String,
    pid: i64,
    started: String,
    notified: String,
    status: String,
    jobs: String,
}

impl WorkerRow {
    fn into_info(self) -> Result<WorkerInfo> {
        Ok(WorkerInfo {
            id: self.id,
            host: self.host,
            pid: self.pid,
            started: codec::parse_stamp(&self.started)?,
            notified: codec::parse_stamp(&self.notified)?,
            status: codec::decode_map(&self.status)?,
            jobs: codec::decode_ids(&self.jobs)?,
        })
    }
}

impl Queue {
    /// Aggregated counters for jobs, workers, and locks.
    pub async fn stats(&self) -> Result<Stats> {
        let now = codec::stamp(Utc::now());
        let row: (i64, i64, i64, i64, i64, i64, i64, i64, i64) = sqlx::query_as(
            "SELECT
               (SELECT COUNT(*) FROM minion_jobs WHERE state = 'active'),
               (SELECT COUNT(*) FROM minion_jobs
                WHERE state = 'inactive' AND (expires IS NULL OR expires > ?)),
               (SELECT COUNT(*) FROM minion_jobs WHERE state = 'inactive' AND delayed > ?),
               (SELECT COUNT(*) FROM minion_jobs WHERE state = 'failed'),
               (SELECT COUNT(*) FROM minion_jobs WHERE state = 'finished'),
               COALESCE((SELECT seq FROM sqlite_sequence WHERE name = 'minion_jobs'), 0),
               (SELECT COUNT(DISTINCT worker) FROM minion_jobs WHERE state = 'active'),
               (SELECT COUNT(*) FROM minion_workers),
               (SELECT COUNT(*) FROM minion_locks WHERE expires > ?)",
        )
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        Ok(Stats {
            active_jobs: row.0,
            inactive_jobs: row.1,
            delayed_jobs: row.2,
            failed_jobs: row.3,
            finished_jobs: row.4,
            enqueued_jobs: row.5,
            active_workers: row.6,
            inactive_workers: row.7 - row.6,
            active_locks: row.8,
            uptime: 0,
        })
    }

    /// Hourly counts of finished and failed jobs for the trailing day.
    ///
    /// Always returns 24 buckets, one hour apart, padding empty hours with
    /// zero counts.
    pub async fn history(&self) -> Result<History> {
        let now = Utc::now();
        let newest_hour = now.timestamp() / 3600 * 3600;
        let oldest_hour = newest_hour - 23 * 3600;
        let horizon = codec::stamp(codec::rewind(
            now,
            std::time::Duration::from_secs((now.timestamp() - oldest_hour) as u64),
        ));

        let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
            "SELECT CAST(strftime('%s', strftime('%Y-%m-%d %H:00:00', finished)) AS INTEGER) AS epoch,
                    SUM(CASE state WHEN 'failed' THEN 1 ELSE 0 END),
                    SUM(CASE state WHEN 'finished' THEN 1 ELSE 0 END)
             FROM minion_jobs
             WHERE finished >= ? AND state IN ('failed', 'finished')
             GROUP BY epoch",
        )
        .bind(&horizon)
        .fetch_all(&self.pool)
        .await?;
        let counts: HashMap<i64, (i64, i64)> = rows
            .into_iter()
            .map(|(epoch, failed, finished)| (epoch, (failed, finished)))
            .collect();

        let daily = (0..24)
            .map(|hour| {
                let epoch = oldest_hour + hour * 3600;
                let (failed_jobs, finished_jobs) = counts.get(&epoch).copied().unwrap_or((0, 0));
                DailyBucket {
                    epoch,
                    failed_jobs,
                    finished_jobs,
                }
            })
            .collect();
        Ok(History { daily })
    }

    /// Page through jobs matching the filter, newest first.
    ///
    /// Inactive jobs whose expiry has passed are treated as gone and never
    /// listed, even before repair removes the rows.
    pub async fn list_jobs(
        &self,
        offset: i64,
        limit: i64,
        options: &ListJobsOptions,
    ) -> Result<JobList> {
        let now = codec::stamp(Utc::now());
        let ids = serde_json::to_string(&options.ids)?;
        let queues = serde_json::to_string(&options.queues)?;
        let states =
            serde_json::to_string(&options.states.iter().map(JobState::as_str).collect::<Vec<_>>())?;
        let tasks = serde_json::to_string(&options.tasks)?;

        const FILTER: &str = "(j.state != 'inactive' OR j.expires IS NULL OR j.expires > ?)
             AND (? IS NULL OR j.id < ?)
             AND (json_array_length(?) = 0 OR j.id IN (SELECT value FROM json_each(?)))
             AND (json_array_length(?) = 0 OR j.queue IN (SELECT value FROM json_each(?)))
             AND (json_array_length(?) = 0 OR j.state IN (SELECT value FROM json_each(?)))
             AND (json_array_length(?) = 0 OR j.task IN (SELECT value FROM json_each(?)))";

        let (total,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM minion_jobs AS j WHERE {FILTER}"
        ))
        .bind(&now)
        .bind(options.before)
        .bind(options.before)
        .bind(&ids)
        .bind(&ids)
        .bind(&queues)
        .bind(&queues)
        .bind(&states)
        .bind(&states)
        .bind(&tasks)
        .bind(&tasks)
        .fetch_one(&self.pool)
        .await?;

        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT j.id, j.args, j.attempts,
                    (SELECT json_group_array(c.id)
                     FROM minion_jobs AS c, json_each(c.parents) AS p
                     WHERE p.value = j.id) AS children,
                    j.created, j.delayed, j.expires, j.finished, j.lax, j.notes,
                    j.parents, j.priority, j.queue, j.result, j.retried, j.retries,
                    j.started, j.state, j.task, j.worker
             FROM minion_jobs AS j
             WHERE {FILTER}
             ORDER BY j.id DESC
             LIMIT ? OFFSET ?"
        ))
        .bind(&now)
        .bind(options.before)
        .bind(options.before)
        .bind(&ids)
        .bind(&ids)
        .bind(&queues)
        .bind(&queues)
        .bind(&states)
        .bind(&states)
        .bind(&tasks)
        .bind(&tasks)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let jobs = rows
            .into_iter()
            .map(JobRow::into_info)
            .collect::<Result<Vec<_>>>()?;
        Ok(JobList { jobs, total })
    }

    /// Page through registered workers, newest first.
    pub async fn list_workers(
        &self,
        offset: i64,
        limit: i64,
        options: &ListWorkersOptions,
    ) -> Result<WorkerList> {
        let ids = serde_json::to_string(&options.ids)?;

        const FILTER: &str = "(? IS NULL OR w.id < ?)
             AND (json_array_length(?) = 0 OR w.id IN (SELECT value FROM json_each(?)))";

        let (total,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM minion_workers AS w WHERE {FILTER}"
        ))
        .bind(options.before)
        .bind(options.before)
        .bind(&ids)
        .bind(&ids)
        .fetch_one(&self.pool)
        .await?;

        let rows: Vec<WorkerRow> = sqlx::query_as(&format!(
            "SELECT w.id, w.host, w.pid, w.started, w.notified, w.status,
                    (SELECT json_group_array(j.id)
                     FROM minion_jobs AS j
                     WHERE j.state = 'active' AND j.worker = w.id) AS jobs
             FROM minion_workers AS w
             WHERE {FILTER}
             ORDER BY w.id DESC
             LIMIT ? OFFSET ?"
        ))
        .bind(options.before)
        .bind(options.before)
        .bind(&ids)
        .bind(&ids)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let workers = rows
            .into_iter()
            .map(WorkerRow::into_info)
            .collect::<Result<Vec<_>>>()?;
        Ok(WorkerList { workers, total })
    }

    /// Page through unexpired leases, newest first.
    pub async fn list_locks(
        &self,
        offset: i64,
        limit: i64,
        options: &ListLocksOptions,
    ) -> Result<LockList> {
        let now = codec::stamp(Utc::now());
        let names = serde_json::to_string(&options.names)?;

        const FILTER: &str = "expires > ?
             AND (json_array_length(?) = 0 OR name IN (SELECT value FROM json_each(?)))";

        let (total,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM minion_locks WHERE {FILTER}"
        ))
        .bind(&now)
        .bind(&names)
        .bind(&names)
        .fetch_one(&self.pool)
        .await?;

        let rows: Vec<(i64, String, String)> = sqlx::query_as(&format!(
            "SELECT id, name, expires FROM minion_locks
             WHERE {FILTER}
             ORDER BY id DESC
             LIMIT ? OFFSET ?"
        ))
        .bind(&now)
        .bind(&names)
        .bind(&names)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let locks = rows
            .into_iter()
            .map(|(id, name, expires)| {
                Ok(LockInfo {
                    id,
                    name,
                    expires: codec::parse_stamp(&expires)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(LockList { locks, total })
    }
}
