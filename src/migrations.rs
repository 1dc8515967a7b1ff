//! Schema migrations for the queue tables.
//!
//! Steps are tracked under the name `minion` in the `minion_migrations`
//! table and applied on first use by [`Queue::connect`](crate::Queue::connect).
//! Each step is embedded raw SQL run with `sqlx::raw_sql`. Steps migrate
//! forward; a backward step exists only where the forward step created the
//! tables it would drop. Steps that merely added columns downgrade by
//! lowering the recorded version and leaving the columns in place.

use crate::error::{QueueError, Result};

use sqlx::SqlitePool;

/// Name under which this step sequence is tracked.
const NAME: &str = "minion";

/// One schema step.
struct Migration {
    version: i64,
    up: &'static str,
    down: Option<&'static str>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        up: r#"
CREATE TABLE IF NOT EXISTS minion_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    args TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 1,
    created TEXT NOT NULL,
    delayed TEXT NOT NULL,
    finished TEXT,
    notes TEXT NOT NULL DEFAULT '{}',
    parents TEXT NOT NULL DEFAULT '[]',
    priority INTEGER NOT NULL DEFAULT 0,
    queue TEXT NOT NULL DEFAULT 'default',
    result TEXT,
    retried TEXT,
    retries INTEGER NOT NULL DEFAULT 0,
    started TEXT,
    state TEXT NOT NULL DEFAULT 'inactive',
    task TEXT NOT NULL,
    worker INTEGER
);
CREATE INDEX IF NOT EXISTS minion_jobs_state_priority_id ON minion_jobs (state, priority DESC, id);
CREATE INDEX IF NOT EXISTS minion_jobs_worker ON minion_jobs (worker);

CREATE TABLE IF NOT EXISTS minion_workers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host TEXT NOT NULL,
    pid INTEGER NOT NULL,
    started TEXT NOT NULL,
    notified TEXT NOT NULL
);
"#,
        down: Some(
            r#"
DROP TABLE IF EXISTS minion_jobs;
DROP TABLE IF EXISTS minion_workers;
"#,
        ),
    },
    Migration {
        version: 2,
        up: r#"
CREATE TABLE IF NOT EXISTS minion_locks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    expires TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS minion_locks_name_expires ON minion_locks (name, expires);
"#,
        down: Some("DROP TABLE IF EXISTS minion_locks;"),
    },
    Migration {
        version: 3,
        up: r#"
ALTER TABLE minion_jobs ADD COLUMN expires TEXT;
ALTER TABLE minion_jobs ADD COLUMN lax INTEGER NOT NULL DEFAULT 0;
CREATE INDEX IF NOT EXISTS minion_jobs_expires ON minion_jobs (expires);
"#,
        down: None,
    },
    Migration {
        version: 4,
        up: r#"
ALTER TABLE minion_workers ADD COLUMN inbox TEXT NOT NULL DEFAULT '[]';
ALTER TABLE minion_workers ADD COLUMN status TEXT NOT NULL DEFAULT '{}';
"#,
        down: None,
    },
];

/// Largest known schema version.
pub(crate) fn latest() -> i64 {
    MIGRATIONS.last().map(|step| step.version).unwrap_or(0)
}

/// Read the active schema version, creating the tracking table if needed.
pub(crate) async fn active_version(pool: &SqlitePool) -> Result<i64> {
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS minion_migrations (name TEXT PRIMARY KEY, version INTEGER NOT NULL)",
    )
    .execute(pool)
    .await?;

    let row: Option<(i64,)> = sqlx::query_as("SELECT version FROM minion_migrations WHERE name = ?")
        .bind(NAME)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(version,)| version).unwrap_or(0))
}

/// Apply all outstanding forward steps.
pub(crate) async fn migrate(pool: &SqlitePool) -> Result<()> {
    migrate_to(pool, latest()).await
}

/// Migrate to an explicit version, forward or backward.
pub(crate) async fn migrate_to(pool: &SqlitePool, target: i64) -> Result<()> {
    if target != 0 && !MIGRATIONS.iter().any(|step| step.version == target) {
        return Err(QueueError::UnknownVersion(target));
    }

    let mut active = active_version(pool).await?;
    let from = active;

    while active < target {
        let step = MIGRATIONS
            .iter()
            .find(|step| step.version > active)
            .ok_or(QueueError::UnknownVersion(target))?;
        sqlx::raw_sql(step.up)
            .execute(pool)
            .await
            .map_err(|source| QueueError::Migration {
                version: step.version,
                source,
            })?;
        active = step.version;
        record_version(pool, active).await?;
    }

    while active > target {
        let step = MIGRATIONS
            .iter()
            .find(|step| step.version == active)
            .ok_or(QueueError::UnknownVersion(active))?;
        if let Some(down) = step.down {
            sqlx::raw_sql(down)
                .execute(pool)
                .await
                .map_err(|source| QueueError::Migration {
                    version: step.version,
                    source,
                })?;
        }
        active = MIGRATIONS
            .iter()
            .filter(|candidate| candidate.version < step.version)
            .map(|candidate| candidate.version)
            .max()
            .unwrap_or(0);
        record_version(pool, active).await?;
    }

    if from != active {
        tracing::info!(name = NAME, from, to = active, "migrated queue schema");
    }
    Ok(())
}

async fn record_version(pool: &SqlitePool, version: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO minion_migrations (name, version) VALUES (?, ?)
         ON CONFLICT(name) DO UPDATE SET version = excluded.version",
    )
    .bind(NAME)
    .bind(version)
    .execute(pool)
    .await?;
    Ok(())
}
