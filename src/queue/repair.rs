//! Maintenance sweep: dead workers, stale rows, orphaned jobs.

use crate::codec;
use crate::error::Result;
use crate::queue::{Queue, FOREGROUND_QUEUE};

use chrono::Utc;
use serde_json::Value;

impl Queue {
    /// Run the maintenance sweep.
    ///
    /// In order: remove workers without a recent heartbeat, drop finished
    /// jobs past retention and inactive jobs past expiry, fail active jobs
    /// whose worker is gone (these go back through the normal retry budget),
    /// and fail jobs that sat runnable in the queue for too long (these do
    /// not retry). Meant to run periodically from one process, but safe to
    /// run anywhere at any time.
    pub async fn repair(&self) -> Result<()> {
        let now = Utc::now();

        // Dead workers go first so their jobs show up as orphaned below.
        let dead = sqlx::query("DELETE FROM minion_workers WHERE notified < ?")
            .bind(codec::stamp(codec::rewind(now, self.config.missing_after)))
            .execute(&self.pool)
            .await?
            .rows_affected();
        if dead > 0 {
            tracing::warn!(count = dead, "removed workers without recent heartbeat");
        }

        // Finished jobs past retention, unless an unfinished child still
        // depends on them.
        let removed = sqlx::query(
            "DELETE FROM minion_jobs
             WHERE state = 'finished' AND finished <= ?
               AND NOT EXISTS (
                 SELECT 1 FROM minion_jobs AS child, json_each(child.parents) AS p
                 WHERE p.value = minion_jobs.id AND child.state <> 'finished')",
        )
        .bind(codec::stamp(codec::rewind(now, self.config.remove_after)))
        .execute(&self.pool)
        .await?
        .rows_affected();

        // Inactive jobs that expired before anyone ran them.
        let expired = sqlx::query("DELETE FROM minion_jobs WHERE state = 'inactive' AND expires <= ?")
            .bind(codec::stamp(now))
            .execute(&self.pool)
            .await?
            .rows_affected();
        if removed + expired > 0 {
            tracing::debug!(removed, expired, "swept old jobs");
        }

        // Jobs claimed by a worker that no longer exists are failed, and the
        // attempts budget decides whether they run again.
        let orphans: Vec<(i64, u32)> = sqlx::query_as(
            "SELECT id, retries FROM minion_jobs AS j
             WHERE j.state = 'active' AND j.queue <> ?
               AND NOT EXISTS (SELECT 1 FROM minion_workers AS w WHERE w.id = j.worker)",
        )
        .bind(FOREGROUND_QUEUE)
        .fetch_all(&self.pool)
        .await?;
        for (id, retries) in orphans {
            tracing::warn!(id, "job orphaned by missing worker");
            self.fail_job(id, retries, Value::String("Worker went away".to_string()))
                .await?;
        }

        // Jobs stuck in the queue are failed outright, with no retry.
        let stuck = sqlx::query(
            "UPDATE minion_jobs
             SET finished = ?, result = ?, state = 'failed'
             WHERE state = 'inactive' AND delayed < ?",
        )
        .bind(codec::stamp(now))
        .bind(codec::encode(&Value::String(
            "Job appears stuck in queue".to_string(),
        ))?)
        .bind(codec::stamp(codec::rewind(now, self.config.stuck_after)))
        .execute(&self.pool)
        .await?
        .rows_affected();
        if stuck > 0 {
            tracing::warn!(count = stuck, "failed jobs stuck in queue");
        }

        Ok(())
    }
}
