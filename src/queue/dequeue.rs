//! Dispatcher: atomic job selection and the blocking poll loop.

use crate::codec;
use crate::error::Result;
use crate::job::{DequeueOptions, DequeuedJob};
use crate::queue::Queue;

use chrono::Utc;
use std::time::Duration;

impl Queue {
    /// Wait up to `wait` for an eligible job and claim it for `worker_id`.
    ///
    /// Makes one selection attempt immediately, then polls every
    /// [`dequeue_interval`](crate::QueueConfig::dequeue_interval) until the
    /// deadline. One final attempt happens after the deadline so a job that
    /// arrived during the last sleep is not missed. There is no other
    /// cancellation primitive; callers that need to react to shutdown pick a
    /// `wait` short enough to get control back between polls.
    pub async fn dequeue(
        &self,
        worker_id: i64,
        wait: Duration,
        options: &DequeueOptions,
    ) -> Result<Option<DequeuedJob>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(job) = self.try_dequeue(worker_id, options).await? {
                return Ok(Some(job));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(self.config.dequeue_interval)).await;
        }
    }

    /// Single selection attempt: claim the next eligible job, or return
    /// `None` without blocking.
    ///
    /// Selection and the transition to `active` happen in one statement, so
    /// two workers with identical candidate sets can never claim the same
    /// row. A job is eligible when it is `inactive`, past its `delayed`
    /// time, not expired, on a requested queue, for a runnable task, and
    /// every parent is out of the way: finished, failed with the job marked
    /// lax, expired, or gone entirely. Candidates are ordered by priority
    /// (larger first), then insertion order.
    pub async fn try_dequeue(
        &self,
        worker_id: i64,
        options: &DequeueOptions,
    ) -> Result<Option<DequeuedJob>> {
        let now = codec::stamp(Utc::now());
        let queues = serde_json::to_string(&options.queues)?;
        let tasks = serde_json::to_string(&options.tasks)?;

        let row: Option<(i64, String, u32, String)> = sqlx::query_as(
            "UPDATE minion_jobs
             SET started = ?, state = 'active', worker = ?
             WHERE id = (
               SELECT j.id FROM minion_jobs AS j
               WHERE j.state = 'inactive'
                 AND j.delayed <= ?
                 AND (j.expires IS NULL OR j.expires > ?)
                 AND j.queue IN (SELECT value FROM json_each(?))
                 AND (? IS NULL OR j.id = ?)
                 AND (json_array_length(?) = 0 OR j.task IN (SELECT value FROM json_each(?)))
                 AND NOT EXISTS (
                   SELECT 1 FROM json_each(j.parents) AS p
                   JOIN minion_jobs AS parent ON parent.id = p.value
                   WHERE parent.state = 'active'
                      OR (parent.state = 'failed' AND j.lax = 0)
                      OR (parent.state = 'inactive'
                          AND (parent.expires IS NULL OR parent.expires > ?)))
               ORDER BY j.priority DESC, j.id ASC
               LIMIT 1
             )
             RETURNING id, args, retries, task",
        )
        .bind(&now)
        .bind(worker_id)
        .bind(&now)
        .bind(&now)
        .bind(&queues)
        .bind(options.id)
        .bind(options.id)
        .bind(&tasks)
        .bind(&tasks)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, args, retries, task)) = row else {
            return Ok(None);
        };
        tracing::debug!(id, worker_id, task = %task, "dequeued job");
        Ok(Some(DequeuedJob {
            id,
            args: codec::decode(&args)?,
            retries,
            task,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::EnqueueOptions;
    use crate::queue::ResetOptions;
    use serde_json::json;

    async fn setup() -> (Queue, i64) {
        let path = std::env::temp_dir().join(format!(
            "drudge_test_dequeue_{}.db",
            uuid::Uuid::new_v4()
        ));
        let queue = Queue::connect(&path).await.unwrap();
        let worker = queue
            .register_worker(None, &Default::default())
            .await
            .unwrap();
        (queue, worker)
    }

    #[tokio::test]
    async fn jobs_come_back_in_insertion_order() {
        let (queue, worker) = setup().await;
        let foo = queue
            .enqueue("foo", json!([]), &EnqueueOptions::default())
            .await
            .unwrap();
        let bar = queue
            .enqueue("bar", json!([]), &EnqueueOptions::default())
            .await
            .unwrap();

        let first = queue
            .dequeue(worker, Duration::ZERO, &Default::default())
            .await
            .unwrap()
            .unwrap();
        let second = queue
            .dequeue(worker, Duration::ZERO, &Default::default())
            .await
            .unwrap()
            .unwrap();

        assert_eq!((first.id, first.task.as_str()), (foo, "foo"));
        assert_eq!((second.id, second.task.as_str()), (bar, "bar"));
        assert!(queue
            .dequeue(worker, Duration::ZERO, &Default::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn higher_priority_wins() {
        let (queue, worker) = setup().await;
        queue
            .enqueue("foo", json!([]), &EnqueueOptions::default())
            .await
            .unwrap();
        let urgent = queue
            .enqueue(
                "foo",
                json!([]),
                &EnqueueOptions {
                    priority: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let job = queue
            .dequeue(worker, Duration::ZERO, &Default::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, urgent);
    }

    #[tokio::test]
    async fn claimed_jobs_carry_worker_and_start_time() {
        let (queue, worker) = setup().await;
        let id = queue
            .enqueue("foo", json!([1, 2]), &EnqueueOptions::default())
            .await
            .unwrap();

        let job = queue
            .dequeue(worker, Duration::ZERO, &Default::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.args, json!([1, 2]));
        assert_eq!(job.retries, 0);

        let info = queue.job_info(id).await.unwrap().unwrap();
        assert_eq!(info.state, crate::JobState::Active);
        assert_eq!(info.worker, Some(worker));
        assert!(info.started.is_some());
    }

    #[tokio::test]
    async fn parents_gate_their_children() {
        let (queue, worker) = setup().await;
        let parent = queue
            .enqueue("parent", json!([]), &EnqueueOptions::default())
            .await
            .unwrap();
        let child = queue
            .enqueue(
                "child",
                json!([]),
                &EnqueueOptions {
                    parents: vec![parent],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // The parent is inactive, then active; the child stays out of reach.
        let first = queue
            .dequeue(worker, Duration::ZERO, &Default::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, parent);
        assert!(queue
            .dequeue(worker, Duration::ZERO, &Default::default())
            .await
            .unwrap()
            .is_none());

        queue.finish_job(parent, 0, json!(null)).await.unwrap();
        let second = queue
            .dequeue(worker, Duration::ZERO, &Default::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, child);
    }

    #[tokio::test]
    async fn failed_parent_blocks_strict_child_forever() {
        let (queue, worker) = setup().await;
        let parent = queue
            .enqueue("parent", json!([]), &EnqueueOptions::default())
            .await
            .unwrap();
        queue
            .enqueue(
                "child",
                json!([]),
                &EnqueueOptions {
                    parents: vec![parent],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        queue
            .dequeue(worker, Duration::ZERO, &Default::default())
            .await
            .unwrap()
            .unwrap();
        queue.fail_job(parent, 0, json!("boom")).await.unwrap();

        assert!(queue
            .dequeue(worker, Duration::ZERO, &Default::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn lax_child_runs_after_parent_failure() {
        let (queue, worker) = setup().await;
        let parent = queue
            .enqueue("parent", json!([]), &EnqueueOptions::default())
            .await
            .unwrap();
        let child = queue
            .enqueue(
                "child",
                json!([]),
                &EnqueueOptions {
                    parents: vec![parent],
                    lax: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        queue
            .dequeue(worker, Duration::ZERO, &Default::default())
            .await
            .unwrap()
            .unwrap();
        queue.fail_job(parent, 0, json!("boom")).await.unwrap();

        let job = queue
            .dequeue(worker, Duration::ZERO, &Default::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, child);
    }

    #[tokio::test]
    async fn missing_parent_counts_as_satisfied() {
        let (queue, worker) = setup().await;
        let child = queue
            .enqueue(
                "child",
                json!([]),
                &EnqueueOptions {
                    parents: vec![4242],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let job = queue
            .dequeue(worker, Duration::ZERO, &Default::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, child);
    }

    #[tokio::test]
    async fn delayed_jobs_stay_hidden_until_due() {
        let (queue, worker) = setup().await;
        let id = queue
            .enqueue(
                "foo",
                json!([]),
                &EnqueueOptions {
                    delay: Duration::from_secs(100),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(queue
            .dequeue(worker, Duration::ZERO, &Default::default())
            .await
            .unwrap()
            .is_none());

        // Rewind the eligibility time and the job surfaces.
        sqlx::query("UPDATE minion_jobs SET delayed = ? WHERE id = ?")
            .bind(codec::stamp(codec::rewind(
                Utc::now(),
                Duration::from_secs(1),
            )))
            .bind(id)
            .execute(queue.pool())
            .await
            .unwrap();

        let job = queue
            .dequeue(worker, Duration::ZERO, &Default::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, id);
    }

    #[tokio::test]
    async fn expired_jobs_are_not_dispatched() {
        let (queue, worker) = setup().await;
        queue
            .enqueue(
                "foo",
                json!([]),
                &EnqueueOptions {
                    expire: Some(Duration::from_millis(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(queue
            .dequeue(worker, Duration::ZERO, &Default::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn queue_and_task_filters_restrict_candidates() {
        let (queue, worker) = setup().await;
        queue
            .enqueue(
                "foo",
                json!([]),
                &EnqueueOptions {
                    queue: "reports".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let plain = queue
            .enqueue("bar", json!([]), &EnqueueOptions::default())
            .await
            .unwrap();

        // Default options only look at the default queue.
        let job = queue
            .dequeue(worker, Duration::ZERO, &Default::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, plain);

        // A task filter that matches nothing dispatches nothing.
        queue
            .reset(&ResetOptions {
                all: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let worker = queue
            .register_worker(None, &Default::default())
            .await
            .unwrap();
        queue
            .enqueue("baz", json!([]), &EnqueueOptions::default())
            .await
            .unwrap();
        let options = DequeueOptions {
            tasks: vec!["other".to_string()],
            ..Default::default()
        };
        assert!(queue
            .dequeue(worker, Duration::ZERO, &options)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn pinned_id_only_matches_that_job() {
        let (queue, worker) = setup().await;
        let first = queue
            .enqueue("foo", json!([]), &EnqueueOptions::default())
            .await
            .unwrap();
        let second = queue
            .enqueue("foo", json!([]), &EnqueueOptions::default())
            .await
            .unwrap();

        let options = DequeueOptions {
            id: Some(second),
            ..Default::default()
        };
        let job = queue
            .dequeue(worker, Duration::ZERO, &options)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, second);

        let leftover = queue
            .dequeue(worker, Duration::ZERO, &Default::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leftover.id, first);
    }

    #[tokio::test]
    async fn concurrent_dequeues_never_share_a_job() {
        let (queue, worker) = setup().await;
        let other = queue
            .register_worker(None, &Default::default())
            .await
            .unwrap();
        for _ in 0..20 {
            queue
                .enqueue("foo", json!([]), &EnqueueOptions::default())
                .await
                .unwrap();
        }

        let drain = |queue: Queue, worker: i64| {
            tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(job) = queue
                    .try_dequeue(worker, &Default::default())
                    .await
                    .unwrap()
                {
                    ids.push(job.id);
                }
                ids
            })
        };
        let first = drain(queue.clone(), worker);
        let second = drain(queue.clone(), other);

        let (first, second) = (first.await.unwrap(), second.await.unwrap());
        assert_eq!(first.len() + second.len(), 20);
        for id in &first {
            assert!(!second.contains(id));
        }
    }

    #[tokio::test]
    async fn waiting_dequeue_picks_up_late_arrivals() {
        let (queue, worker) = setup().await;
        let enqueuer = queue.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            enqueuer
                .enqueue("foo", json!([]), &EnqueueOptions::default())
                .await
                .unwrap()
        });

        let job = queue
            .dequeue(worker, Duration::from_secs(5), &Default::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, handle.await.unwrap());
    }
}
