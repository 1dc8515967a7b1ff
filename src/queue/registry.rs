//! Worker registry: registration, heartbeats, and the broadcast inbox.

use crate::codec;
use crate::error::Result;
use crate::queue::Queue;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// One remote-control message delivered through a worker inbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    /// Command name.
    pub name: String,
    /// Command arguments.
    pub args: Vec<Value>,
}

/// Options accepted by [`Queue::register_worker`](crate::Queue::register_worker).
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Free-form status map stored with the worker row.
    pub status: Map<String, Value>,
}

/// Description of a registered worker, as returned by listings.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    /// Worker id.
    pub id: i64,
    /// Host the worker runs on.
    pub host: String,
    /// Process id on that host.
    pub pid: i64,
    /// Registration time.
    pub started: DateTime<Utc>,
    /// Last heartbeat.
    pub notified: DateTime<Utc>,
    /// Free-form status map.
    pub status: Map<String, Value>,
    /// Ids of the jobs this worker currently has active.
    pub jobs: Vec<i64>,
}

/// One page of workers plus the total count matching the filter.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerList {
    /// Workers on this page, newest first.
    pub workers: Vec<WorkerInfo>,
    /// Workers matching the filter before pagination.
    pub total: i64,
}

/// Filters accepted by [`Queue::list_workers`](crate::Queue::list_workers).
#[derive(Debug, Clone, Default)]
pub struct ListWorkersOptions {
    /// Only workers with ids strictly below this one.
    pub before: Option<i64>,
    /// Only these worker ids.
    pub ids: Vec<i64>,
}

impl Queue {
    /// Register a worker, or heartbeat an existing registration.
    ///
    /// With an `id` whose row still exists, refreshes `notified` and the
    /// status map and returns the same id. Otherwise inserts a fresh row for
    /// this host and process and returns its new id.
    pub async fn register_worker(
        &self,
        id: Option<i64>,
        options: &RegisterOptions,
    ) -> Result<i64> {
        let now = codec::stamp(Utc::now());
        let status = codec::encode_map(&options.status)?;

        if let Some(id) = id {
            let rows = sqlx::query("UPDATE minion_workers SET notified = ?, status = ? WHERE id = ?")
                .bind(&now)
                .bind(&status)
                .bind(id)
                .execute(&self.pool)
                .await?
                .rows_affected();
            if rows > 0 {
                return Ok(id);
            }
        }

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO minion_workers (host, pid, started, notified, status)
             VALUES (?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(host())
        .bind(std::process::id() as i64)
        .bind(&now)
        .bind(&now)
        .bind(&status)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(worker_id = id, "registered worker");
        Ok(id)
    }

    /// Remove a worker registration.
    ///
    /// Jobs the worker still had active become orphans and are reclaimed by
    /// the next [`repair`](Queue::repair).
    pub async fn unregister_worker(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM minion_workers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        tracing::info!(worker_id = id, "unregistered worker");
        Ok(())
    }

    /// Append a command to worker inboxes.
    ///
    /// An empty `ids` list targets every registered worker. Returns whether
    /// at least one inbox was written.
    pub async fn broadcast(&self, command: &str, args: &[Value], ids: &[i64]) -> Result<bool> {
        let mut entry = vec![Value::String(command.to_string())];
        entry.extend(args.iter().cloned());
        let message = codec::encode(&Value::Array(entry))?;
        let ids = serde_json::to_string(ids)?;

        let rows = sqlx::query(
            "UPDATE minion_workers
             SET inbox = json_insert(inbox, '$[#]', json(?))
             WHERE json_array_length(?) = 0 OR id IN (SELECT value FROM json_each(?))",
        )
        .bind(&message)
        .bind(&ids)
        .bind(&ids)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    /// Drain a worker's inbox, returning the commands accumulated since the
    /// last call.
    ///
    /// Read and clear happen inside one transaction so a concurrent
    /// broadcast is either returned now or kept for the next call, never
    /// dropped.
    pub async fn receive(&self, id: i64) -> Result<Vec<Command>> {
        let mut tx = self.pool.begin().await?;
        let row: Option<(String,)> = sqlx::query_as("SELECT inbox FROM minion_workers WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some((inbox,)) = row else {
            return Ok(Vec::new());
        };
        if inbox == "[]" {
            return Ok(Vec::new());
        }

        sqlx::query("UPDATE minion_workers SET inbox = '[]' WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let entries: Vec<Vec<Value>> = serde_json::from_str(&inbox)?;
        let mut commands = Vec::with_capacity(entries.len());
        for mut entry in entries {
            if entry.is_empty() {
                tracing::warn!(worker_id = id, "dropping empty inbox entry");
                continue;
            }
            let args = entry.split_off(1);
            match entry.into_iter().next() {
                Some(Value::String(name)) => commands.push(Command { name, args }),
                _ => tracing::warn!(worker_id = id, "dropping malformed inbox entry"),
            }
        }
        Ok(commands)
    }
}

/// Best-effort hostname for worker registration.
fn host() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "localhost".to_string())
}
