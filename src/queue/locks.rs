//! Named counted leases with expiry.
//!
//! Locks are rows in `minion_locks`; holding up to `limit` leases on the
//! same name at once is allowed, so a lock with a limit above one doubles
//! as a semaphore. Leases expire on their own, which keeps a crashed
//! holder from wedging the name forever.

use crate::codec;
use crate::error::Result;
use crate::queue::Queue;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;

/// Options accepted by [`Queue::lock`](crate::Queue::lock).
#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    /// Leases that may exist for the name at once.
    pub limit: u32,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self { limit: 1 }
    }
}

/// Description of an active lease, as returned by listings.
#[derive(Debug, Clone, Serialize)]
pub struct LockInfo {
    /// Lease id.
    pub id: i64,
    /// Lock name.
    pub name: String,
    /// Expiry time.
    pub expires: DateTime<Utc>,
}

/// One page of locks plus the total count matching the filter.
#[derive(Debug, Clone, Serialize)]
pub struct LockList {
    /// Leases on this page, newest first.
    pub locks: Vec<LockInfo>,
    /// Leases matching the filter before pagination.
    pub total: i64,
}

/// Filters accepted by [`Queue::list_locks`](crate::Queue::list_locks).
#[derive(Debug, Clone, Default)]
pub struct ListLocksOptions {
    /// Only leases with these names.
    pub names: Vec<String>,
}

impl Queue {
    /// Try to acquire a lease on `name` for `duration`.
    ///
    /// Expired leases are swept first. The count-against-limit check and
    /// the insert happen in a single statement, so two racing callers can
    /// never both squeeze past the limit. A zero `duration` only checks
    /// whether a lease could currently be acquired.
    pub async fn lock(&self, name: &str, duration: Duration, options: &LockOptions) -> Result<bool> {
        let now = Utc::now();
        sqlx::query("DELETE FROM minion_locks WHERE expires <= ?")
            .bind(codec::stamp(now))
            .execute(&self.pool)
            .await?;

        if duration.is_zero() {
            let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM minion_locks WHERE name = ?")
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
            return Ok(count < i64::from(options.limit));
        }

        let rows = sqlx::query(
            "INSERT INTO minion_locks (name, expires)
             SELECT ?, ?
             WHERE (SELECT COUNT(*) FROM minion_locks WHERE name = ?) < ?",
        )
        .bind(name)
        .bind(codec::stamp(codec::forward(now, duration)))
        .bind(name)
        .bind(options.limit)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let acquired = rows > 0;
        tracing::trace!(name, acquired, "lock attempt");
        Ok(acquired)
    }

    /// Release one held lease on `name`, earliest expiry first.
    ///
    /// Returns whether a lease was released.
    pub async fn unlock(&self, name: &str) -> Result<bool> {
        let rows = sqlx::query(
            "DELETE FROM minion_locks
             WHERE id = (
               SELECT id FROM minion_locks
               WHERE name = ? AND expires > ?
               ORDER BY expires ASC, id ASC
               LIMIT 1
             )",
        )
        .bind(name)
        .bind(codec::stamp(Utc::now()))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    /// Run `f` while holding a lease on `name`.
    ///
    /// Returns `Ok(None)` without running `f` when the lease was not
    /// available; otherwise releases the lease once `f` resolves and
    /// returns its output. A callback that panics leaves the lease to
    /// expire on its own.
    pub async fn with_lock<F, Fut, T>(
        &self,
        name: &str,
        duration: Duration,
        options: &LockOptions,
        f: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.lock(name, duration, options).await? {
            return Ok(None);
        }
        let value = f().await;
        self.unlock(name).await?;
        Ok(Some(value))
    }
}
