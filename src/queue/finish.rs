//! Completion path: terminal transitions and automatic retry.

use crate::codec;
use crate::error::Result;
use crate::job::{JobState, RetryOptions};
use crate::queue::Queue;

use chrono::Utc;
use serde_json::Value;

impl Queue {
    /// Transition an active job to `finished` and store its result.
    ///
    /// Returns `false` when the row was not in `active` with the given
    /// retry count, which means the job was reclaimed by repair or retried
    /// from under the worker in the meantime.
    pub async fn finish_job(&self, id: i64, retries: u32, result: Value) -> Result<bool> {
        self.update_job(JobState::Finished, id, retries, result)
            .await
    }

    /// Transition an active job to `failed` and store its result.
    ///
    /// While attempts remain the job is immediately re-enqueued with a
    /// [`backoff`](crate::QueueConfig::backoff) delay; the `false`/`true`
    /// contract matches [`finish_job`](Queue::finish_job).
    pub async fn fail_job(&self, id: i64, retries: u32, result: Value) -> Result<bool> {
        self.update_job(JobState::Failed, id, retries, result).await
    }

    async fn update_job(
        &self,
        state: JobState,
        id: i64,
        retries: u32,
        result: Value,
    ) -> Result<bool> {
        let row: Option<(u32,)> = sqlx::query_as(
            "UPDATE minion_jobs
             SET finished = ?, result = ?, state = ?
             WHERE id = ? AND retries = ? AND state = 'active'
             RETURNING attempts",
        )
        .bind(codec::stamp(Utc::now()))
        .bind(codec::encode(&result)?)
        .bind(state.as_str())
        .bind(id)
        .bind(retries)
        .fetch_optional(&self.pool)
        .await?;

        let Some((attempts,)) = row else {
            return Ok(false);
        };
        tracing::debug!(id, state = %state, "job completed");

        if state == JobState::Failed && retries + 1 < attempts {
            return self.auto_retry_job(id, retries, attempts).await;
        }
        Ok(true)
    }

    /// Re-enqueue a failed job with backoff, keeping its attempts budget.
    /// Keyed on `(id, retries)` so a concurrent explicit retry wins.
    pub(crate) async fn auto_retry_job(&self, id: i64, retries: u32, attempts: u32) -> Result<bool> {
        let delay = (self.config.backoff)(retries);
        self.retry_job(
            id,
            retries,
            &RetryOptions {
                attempts: Some(attempts),
                delay: Some(delay),
                ..Default::default()
            },
        )
        .await
    }
}
