//! Tunables for dispatch, maintenance, and retry backoff.

use std::sync::Arc;
use std::time::Duration;

/// Maps the number of times a job has been retried to the delay before its
/// next attempt.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Runtime tunables for a [`Queue`](crate::Queue).
///
/// The defaults match the behavior most deployments want; an embedding
/// runner can override any of them with struct update syntax:
///
/// ```
/// use drudge::QueueConfig;
/// use std::time::Duration;
///
/// let config = QueueConfig {
///     missing_after: Duration::from_secs(300),
///     ..QueueConfig::default()
/// };
/// ```
#[derive(Clone)]
pub struct QueueConfig {
    /// Sleep between selection attempts while `dequeue` waits for work.
    pub dequeue_interval: Duration,
    /// Workers whose last heartbeat is older than this are considered dead
    /// and removed by `repair`.
    pub missing_after: Duration,
    /// Finished jobs older than this are removed by `repair`, once no
    /// unfinished child depends on them.
    pub remove_after: Duration,
    /// Inactive jobs that have been runnable longer than this are failed by
    /// `repair` without retry.
    pub stuck_after: Duration,
    /// Delay applied when a failed job with attempts remaining is
    /// automatically re-enqueued.
    pub backoff: BackoffFn,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dequeue_interval: Duration::from_millis(500),
            missing_after: Duration::from_secs(30 * 60),
            remove_after: Duration::from_secs(2 * 24 * 60 * 60),
            stuck_after: Duration::from_secs(2 * 24 * 60 * 60),
            backoff: Arc::new(default_backoff),
        }
    }
}

impl std::fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConfig")
            .field("dequeue_interval", &self.dequeue_interval)
            .field("missing_after", &self.missing_after)
            .field("remove_after", &self.remove_after)
            .field("stuck_after", &self.stuck_after)
            .finish_non_exhaustive()
    }
}

/// Default backoff: fifteen seconds plus the fourth power of the retry count.
pub fn default_backoff(retries: u32) -> Duration {
    Duration::from_secs(u64::from(retries).pow(4) + 15)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_with_retries() {
        assert_eq!(default_backoff(0), Duration::from_secs(15));
        assert_eq!(default_backoff(1), Duration::from_secs(16));
        assert_eq!(default_backoff(4), Duration::from_secs(271));
        assert!(default_backoff(5) > default_backoff(4));
    }
}
