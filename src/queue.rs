//! Queue: the persistent backend handle.
//!
//! One `Queue` per process. Every producer and worker opens its own handle
//! on the shared database file; the file is the only synchronization
//! primitive between them, and each operation is a short transaction.

use crate::codec;
use crate::config::QueueConfig;
use crate::error::Result;
use crate::job::{EnqueueOptions, JobInfo, ListJobsOptions, RetryOptions};
use crate::migrations;

use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

mod dequeue;
mod finish;
pub mod locks;
pub mod registry;
mod repair;
pub mod report;

/// Queue repair leaves alone when reclaiming orphaned jobs, so an operator
/// can move a job here and run it in the foreground without the sweep
/// stealing it back.
pub const FOREGROUND_QUEUE: &str = "minion_foreground";

/// Handle on the shared queue database.
///
/// Cheap to clone; clones share the same connection pool and tunables.
#[derive(Clone)]
pub struct Queue {
    pool: SqlitePool,
    config: QueueConfig,
}

impl Queue {
    /// Open (or create) the queue database at `path` with default tunables.
    ///
    /// Applies outstanding schema migrations before returning.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        Self::connect_with(path, QueueConfig::default()).await
    }

    /// Open the queue database with explicit tunables.
    pub async fn connect_with(path: impl AsRef<Path>, config: QueueConfig) -> Result<Self> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        migrations::migrate(&pool).await?;

        tracing::debug!(path = %path.display(), "opened queue database");
        Ok(Self { pool, config })
    }

    /// Wrap an existing pool, applying outstanding schema migrations.
    pub async fn from_pool(pool: SqlitePool, config: QueueConfig) -> Result<Self> {
        migrations::migrate(&pool).await?;
        Ok(Self { pool, config })
    }

    /// Insert a new job in state `inactive` and return its id.
    ///
    /// Ids are assigned by the store and strictly increase across the life
    /// of the database, so insertion order within a priority band is the
    /// dispatch order.
    pub async fn enqueue(&self, task: &str, args: Value, options: &EnqueueOptions) -> Result<i64> {
        let now = Utc::now();
        let delayed = codec::stamp(codec::forward(now, options.delay));
        let expires = options
            .expire
            .map(|expire| codec::stamp(codec::forward(now, expire)));

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO minion_jobs (args, attempts, created, delayed, expires, lax, notes, parents, priority, queue, task)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(codec::encode(&args)?)
        .bind(options.attempts)
        .bind(codec::stamp(now))
        .bind(&delayed)
        .bind(&expires)
        .bind(options.lax)
        .bind(codec::encode_map(&options.notes)?)
        .bind(serde_json::to_string(&options.parents)?)
        .bind(options.priority)
        .bind(&options.queue)
        .bind(task)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(id, task, queue = %options.queue, "enqueued job");
        Ok(id)
    }

    /// Return a job to `inactive` for another round of dispatch.
    ///
    /// The update is keyed on `(id, retries)`: if the row's retry count has
    /// advanced in the meantime the call is a no-op and returns `false`.
    /// Options override the stored values; `None` keeps them.
    pub async fn retry_job(&self, id: i64, retries: u32, options: &RetryOptions) -> Result<bool> {
        let now = Utc::now();
        let delayed = codec::stamp(codec::forward(now, options.delay.unwrap_or_default()));
        let expires = options
            .expire
            .map(|expire| codec::stamp(codec::forward(now, expire)));
        let parents = options
            .parents
            .as_ref()
            .map(|parents| serde_json::to_string(parents))
            .transpose()?;

        let rows = sqlx::query(
            "UPDATE minion_jobs
             SET attempts = COALESCE(?, attempts),
                 delayed = ?,
                 expires = COALESCE(?, expires),
                 lax = COALESCE(?, lax),
                 parents = COALESCE(?, parents),
                 priority = COALESCE(?, priority),
                 queue = COALESCE(?, queue),
                 retried = ?,
                 retries = retries + 1,
                 state = 'inactive'
             WHERE id = ? AND retries = ?",
        )
        .bind(options.attempts)
        .bind(&delayed)
        .bind(&expires)
        .bind(options.lax)
        .bind(&parents)
        .bind(options.priority)
        .bind(&options.queue)
        .bind(codec::stamp(now))
        .bind(id)
        .bind(retries)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows > 0 {
            tracing::debug!(id, "job returned to queue for retry");
        }
        Ok(rows > 0)
    }

    /// Delete a job that is not currently running.
    ///
    /// Returns `false` when the job does not exist or is `active`.
    pub async fn remove_job(&self, id: i64) -> Result<bool> {
        let rows = sqlx::query(
            "DELETE FROM minion_jobs
             WHERE id = ? AND state IN ('inactive', 'failed', 'finished')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    /// Merge `notes` into a job's notes map.
    ///
    /// A `null` value removes the key; other values replace it. Keys
    /// containing `.`, `[` or `]` are rejected before touching storage.
    /// Returns `false` when the job does not exist.
    pub async fn note(&self, id: i64, notes: &Map<String, Value>) -> Result<bool> {
        for key in notes.keys() {
            codec::validate_note_key(key)?;
        }

        let rows = sqlx::query("UPDATE minion_jobs SET notes = json_patch(notes, ?) WHERE id = ?")
            .bind(codec::encode_map(notes)?)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows > 0)
    }

    /// Look up a single job by id.
    pub async fn job_info(&self, id: i64) -> Result<Option<JobInfo>> {
        let options = ListJobsOptions {
            ids: vec![id],
            ..Default::default()
        };
        Ok(self.list_jobs(0, 1, &options).await?.jobs.into_iter().next())
    }

    /// Wipe queue state.
    ///
    /// `all` removes every job, worker, and lock and restarts id assignment
    /// from one; `locks` removes only the locks.
    pub async fn reset(&self, options: &ResetOptions) -> Result<()> {
        if options.all {
            sqlx::raw_sql(
                "DELETE FROM minion_jobs;
                 DELETE FROM minion_workers;
                 DELETE FROM minion_locks;
                 DELETE FROM sqlite_sequence
                 WHERE name IN ('minion_jobs', 'minion_workers', 'minion_locks');",
            )
            .execute(&self.pool)
            .await?;
            tracing::info!("reset queue state");
        } else if options.locks {
            sqlx::query("DELETE FROM minion_locks")
                .execute(&self.pool)
                .await?;
            tracing::info!("reset queue locks");
        }
        Ok(())
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Options accepted by [`Queue::reset`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ResetOptions {
    /// Remove all jobs, workers, and locks and restart id assignment.
    pub all: bool,
    /// Remove all locks.
    pub locks: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use serde_json::json;

    async fn setup() -> Queue {
        let path = std::env::temp_dir().join(format!("drudge_test_queue_{}.db", uuid::Uuid::new_v4()));
        Queue::connect(&path).await.unwrap()
    }

    #[tokio::test]
    async fn enqueue_assigns_increasing_ids() {
        let queue = setup().await;

        let first = queue
            .enqueue("foo", json!([]), &EnqueueOptions::default())
            .await
            .unwrap();
        let second = queue
            .enqueue("foo", json!([]), &EnqueueOptions::default())
            .await
            .unwrap();

        assert!(second > first);
    }

    #[tokio::test]
    async fn enqueue_stores_options() {
        let queue = setup().await;
        let parent = queue
            .enqueue("parent", json!([]), &EnqueueOptions::default())
            .await
            .unwrap();

        let mut notes = Map::new();
        notes.insert("stage".to_string(), json!("ingest"));
        let id = queue
            .enqueue(
                "import",
                json!(["/tmp/batch.csv", 7]),
                &EnqueueOptions {
                    attempts: 3,
                    delay: Duration::from_secs(60),
                    expire: Some(Duration::from_secs(3600)),
                    lax: true,
                    notes,
                    parents: vec![parent],
                    priority: 5,
                    queue: "imports".to_string(),
                },
            )
            .await
            .unwrap();

        let info = queue.job_info(id).await.unwrap().unwrap();
        assert_eq!(info.task, "import");
        assert_eq!(info.args, json!(["/tmp/batch.csv", 7]));
        assert_eq!(info.attempts, 3);
        assert_eq!(info.state, JobState::Inactive);
        assert_eq!(info.parents, vec![parent]);
        assert_eq!(info.priority, 5);
        assert_eq!(info.queue, "imports");
        assert!(info.lax);
        assert_eq!(info.notes.get("stage"), Some(&json!("ingest")));
        assert!(info.delayed > info.created);
        assert!(info.expires.unwrap() > info.delayed);
        assert!(info.started.is_none());
        assert!(info.finished.is_none());
        assert!(info.worker.is_none());

        let parent_info = queue.job_info(parent).await.unwrap().unwrap();
        assert_eq!(parent_info.children, vec![id]);
    }

    #[tokio::test]
    async fn retry_is_keyed_on_retries() {
        let queue = setup().await;
        let id = queue
            .enqueue("foo", json!([]), &EnqueueOptions::default())
            .await
            .unwrap();

        assert!(queue.retry_job(id, 0, &RetryOptions::default()).await.unwrap());
        // The row has advanced to retries = 1, so the stale retry is a no-op.
        assert!(!queue.retry_job(id, 0, &RetryOptions::default()).await.unwrap());

        let info = queue.job_info(id).await.unwrap().unwrap();
        assert_eq!(info.retries, 1);
        assert_eq!(info.state, JobState::Inactive);
        assert!(info.retried.is_some());
    }

    #[tokio::test]
    async fn retry_overrides_only_supplied_options() {
        let queue = setup().await;
        let id = queue
            .enqueue(
                "foo",
                json!([]),
                &EnqueueOptions {
                    attempts: 2,
                    priority: 9,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let retried = queue
            .retry_job(
                id,
                0,
                &RetryOptions {
                    queue: Some("slow".to_string()),
                    delay: Some(Duration::from_secs(300)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(retried);

        let info = queue.job_info(id).await.unwrap().unwrap();
        assert_eq!(info.queue, "slow");
        assert_eq!(info.attempts, 2);
        assert_eq!(info.priority, 9);
        assert!(info.delayed > Utc::now());
    }

    #[tokio::test]
    async fn remove_job_spares_active_jobs() {
        let queue = setup().await;
        let worker = queue
            .register_worker(None, &Default::default())
            .await
            .unwrap();
        let id = queue
            .enqueue("foo", json!([]), &EnqueueOptions::default())
            .await
            .unwrap();
        queue
            .dequeue(worker, Duration::ZERO, &Default::default())
            .await
            .unwrap()
            .unwrap();

        assert!(!queue.remove_job(id).await.unwrap());

        queue.finish_job(id, 0, json!(null)).await.unwrap();
        assert!(queue.remove_job(id).await.unwrap());
        assert!(queue.job_info(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn notes_merge_and_remove_keys() {
        let queue = setup().await;
        let id = queue
            .enqueue("foo", json!([]), &EnqueueOptions::default())
            .await
            .unwrap();

        let mut notes = Map::new();
        notes.insert("foo".to_string(), json!("bar"));
        notes.insert("answer".to_string(), json!(42));
        assert!(queue.note(id, &notes).await.unwrap());

        let mut removal = Map::new();
        removal.insert("foo".to_string(), Value::Null);
        assert!(queue.note(id, &removal).await.unwrap());

        let info = queue.job_info(id).await.unwrap().unwrap();
        assert!(!info.notes.contains_key("foo"));
        assert_eq!(info.notes.get("answer"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn notes_reject_reserved_characters() {
        let queue = setup().await;
        let id = queue
            .enqueue("foo", json!([]), &EnqueueOptions::default())
            .await
            .unwrap();

        let mut notes = Map::new();
        notes.insert("bad.key".to_string(), json!(1));
        assert!(matches!(
            queue.note(id, &notes).await,
            Err(crate::QueueError::InvalidNoteKey(_))
        ));

        assert!(!queue.note(9999, &Map::new()).await.unwrap());
    }

    #[tokio::test]
    async fn reset_all_restarts_id_assignment() {
        let queue = setup().await;
        queue
            .enqueue("foo", json!([]), &EnqueueOptions::default())
            .await
            .unwrap();
        queue
            .register_worker(None, &Default::default())
            .await
            .unwrap();
        queue
            .lock("concurrent", Duration::from_secs(60), &Default::default())
            .await
            .unwrap();

        queue
            .reset(&ResetOptions {
                all: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.enqueued_jobs, 0);
        assert_eq!(stats.active_locks, 0);
        assert_eq!(stats.inactive_workers, 0);

        let id = queue
            .enqueue("foo", json!([]), &EnqueueOptions::default())
            .await
            .unwrap();
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn reset_locks_only_touches_locks() {
        let queue = setup().await;
        let id = queue
            .enqueue("foo", json!([]), &EnqueueOptions::default())
            .await
            .unwrap();
        queue
            .lock("concurrent", Duration::from_secs(60), &Default::default())
            .await
            .unwrap();

        queue
            .reset(&ResetOptions {
                locks: true,
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(queue.job_info(id).await.unwrap().is_some());
        assert_eq!(queue.stats().await.unwrap().active_locks, 0);
    }
}
