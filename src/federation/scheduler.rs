//! Task scheduling
//!
//! [`TaskScheduler`] is the contract the engine needs from a durable
//! scheduler. [`LocalScheduler`] implements it in-process with tokio timers;
//! fired jobs are sent to a channel drained by the job worker.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::jobs::Job;
use crate::error::AppError;

#[async_trait]
pub trait TaskScheduler: Send + Sync {
    /// Schedule `job` under `key`, replacing any task still pending for the
    /// same key. The replacement is atomic per key.
    ///
    /// Returns true when a pending task was replaced.
    async fn schedule(&self, key: &str, job: Job, delay: Option<Duration>)
    -> Result<bool, AppError>;

    /// Cancel the pending task for `key`. Returns true when one was cancelled.
    async fn cancel(&self, key: &str) -> bool;

    /// Whether a task is pending for `key`.
    async fn is_pending(&self, key: &str) -> bool;
}

struct PendingTask {
    token: u64,
    handle: JoinHandle<()>,
}

/// In-process scheduler with abortable timer tasks.
pub struct LocalScheduler {
    pending: Arc<Mutex<HashMap<String, PendingTask>>>,
    sender: mpsc::UnboundedSender<Job>,
    next_token: AtomicU64,
}

impl LocalScheduler {
    /// Create a scheduler and the receiver its fired jobs are sent to.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let scheduler = Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            sender,
            next_token: AtomicU64::new(1),
        };
        (scheduler, receiver)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().map(|pending| pending.len()).unwrap_or(0)
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, PendingTask>>, AppError> {
        self.pending
            .lock()
            .map_err(|_| AppError::Internal(anyhow::anyhow!("scheduler lock poisoned")))
    }
}

#[async_trait]
impl TaskScheduler for LocalScheduler {
    async fn schedule(
        &self,
        key: &str,
        job: Job,
        delay: Option<Duration>,
    ) -> Result<bool, AppError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.lock()?;

        let replaced = match pending.remove(key) {
            Some(previous) => {
                previous.handle.abort();
                true
            }
            None => false,
        };

        let tasks = self.pending.clone();
        let sender = self.sender.clone();
        let task_key = key.to_string();
        let handle = tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            // A task replaced or cancelled after waking must not fire.
            let still_current = match tasks.lock() {
                Ok(mut tasks) => {
                    if tasks.get(&task_key).map(|t| t.token) == Some(token) {
                        tasks.remove(&task_key);
                        true
                    } else {
                        false
                    }
                }
                Err(_) => false,
            };

            if still_current && sender.send(job).is_err() {
                tracing::warn!(key = %task_key, "Job channel closed; dropping scheduled job");
            }
        });

        pending.insert(key.to_string(), PendingTask { token, handle });
        tracing::debug!(key = %key, ?delay, replaced, "Task scheduled");
        Ok(replaced)
    }

    async fn cancel(&self, key: &str) -> bool {
        let removed = match self.lock() {
            Ok(mut pending) => pending.remove(key),
            Err(_) => None,
        };
        match removed {
            Some(task) => {
                task.handle.abort();
                tracing::debug!(key = %key, "Task cancelled");
                true
            }
            None => false,
        }
    }

    async fn is_pending(&self, key: &str) -> bool {
        self.lock()
            .map(|pending| pending.contains_key(key))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn import_job(n: usize) -> Job {
        Job::ImportOutbox {
            actor_id: format!("https://remote.example/users/{}", n),
            group_id: "https://forum.example/ap/group/1".to_string(),
        }
    }

    #[tokio::test]
    async fn rescheduling_replaces_pending_task() {
        let (scheduler, mut receiver) = LocalScheduler::new();

        let replaced = scheduler
            .schedule("deliver:a:b:c", import_job(1), Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(!replaced);

        let replaced = scheduler
            .schedule("deliver:a:b:c", import_job(2), Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(replaced);
        assert_eq!(scheduler.pending_count(), 1);

        let fired = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired, import_job(2));

        // The replaced job never fires.
        assert!(
            tokio::time::timeout(Duration::from_millis(300), receiver.recv())
                .await
                .is_err()
        );
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_prevents_firing() {
        let (scheduler, mut receiver) = LocalScheduler::new();
        scheduler
            .schedule("k", import_job(1), Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(scheduler.is_pending("k").await);
        assert!(scheduler.cancel("k").await);
        assert!(!scheduler.cancel("k").await);

        assert!(
            tokio::time::timeout(Duration::from_millis(200), receiver.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn immediate_jobs_fire_without_delay() {
        let (scheduler, mut receiver) = LocalScheduler::new();
        scheduler.schedule("now", import_job(3), None).await.unwrap();

        let fired = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired, import_job(3));
    }
}
