use std::sync::{Arc, OnceLock};

use anyhow::Result;
use futures::future::BoxFuture;
use serde::Serialize;
use uuid::Uuid;

use crate::store::RecordStore;

use super::job::{Job, JobPayload, QueueName};

/// How enqueued jobs get executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// Jobs wait in the store for the worker runtime.
    #[default]
    Queue,
    /// Jobs run immediately on the enqueueing task. Deployment fallback for
    /// environments without a worker runtime; failures are recorded on the
    /// job row, not surfaced to the enqueuer.
    Inline,
}

impl QueueMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueMode::Queue => "queue",
            QueueMode::Inline => "inline",
        }
    }
}

/// Per-queue job counts by lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub delayed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnqueueReceipt {
    pub job_id: Uuid,
    /// True when an active job with the same dedupe key absorbed this
    /// enqueue; `job_id` then names the existing job.
    pub duplicate: bool,
    pub mode: &'static str,
}

type InlineExecutor = Box<dyn Fn(Job) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Front door for job submission. Dedupe happens here, before the job row is
/// written, so both queue and inline modes share it.
pub struct JobQueue {
    store: Arc<dyn RecordStore>,
    mode: QueueMode,
    inline: OnceLock<InlineExecutor>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn RecordStore>, mode: QueueMode) -> Self {
        Self {
            store,
            mode,
            inline: OnceLock::new(),
        }
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    /// Install the executor used in inline mode. Wired once at startup, after
    /// the handler registry and dependencies exist.
    pub fn install_inline_executor(
        &self,
        executor: impl Fn(Job) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    ) {
        if self.inline.set(Box::new(executor)).is_err() {
            tracing::warn!("inline executor already installed");
        }
    }

    pub async fn enqueue(&self, payload: JobPayload) -> Result<EnqueueReceipt> {
        if let Some(key) = payload.dedupe_key() {
            if let Some(existing) = self.store.find_active_job(&key).await? {
                tracing::debug!(
                    queue = %existing.queue,
                    dedupe_key = %key,
                    job_id = %existing.id,
                    "duplicate enqueue absorbed"
                );
                return Ok(EnqueueReceipt {
                    job_id: existing.id,
                    duplicate: true,
                    mode: self.mode.as_str(),
                });
            }
        }

        let job = Job::new(payload);
        let job_id = job.id;
        self.store.insert_job(&job).await?;
        tracing::debug!(queue = %job.queue, job_id = %job_id, "job enqueued");

        if self.mode == QueueMode::Inline {
            self.run_inline(job).await?;
        }

        Ok(EnqueueReceipt {
            job_id,
            duplicate: false,
            mode: self.mode.as_str(),
        })
    }

    pub async fn stats(&self, queue: QueueName) -> Result<QueueCounts> {
        self.store.queue_counts(queue).await
    }

    async fn run_inline(&self, job: Job) -> Result<()> {
        let Some(executor) = self.inline.get() else {
            // Startup wiring bug; fail the row so it is visible in stats.
            self.store
                .mark_job_failed(job.id, "no inline executor installed")
                .await?;
            return Ok(());
        };

        let job_id = job.id;
        let queue = job.queue;
        match executor(job).await {
            Ok(()) => self.store.mark_job_completed(job_id).await,
            Err(e) => {
                tracing::warn!(queue = %queue, job_id = %job_id, error = %e, "inline job failed");
                self.store.mark_job_failed(job_id, &e.to_string()).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::JobStatus;
    use crate::store::MemoryStore;

    fn sync_payload(user_id: Uuid) -> JobPayload {
        JobPayload::Sync {
            user_id,
            full: false,
        }
    }

    #[tokio::test]
    async fn duplicate_enqueue_returns_existing_job() {
        let store = Arc::new(MemoryStore::new());
        let queue = JobQueue::new(store, QueueMode::Queue);
        let user_id = Uuid::new_v4();

        let first = queue.enqueue(sync_payload(user_id)).await.unwrap();
        let second = queue.enqueue(sync_payload(user_id)).await.unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(second.job_id, first.job_id);

        let counts = queue.stats(QueueName::Sync).await.unwrap();
        assert_eq!(counts.waiting, 1);
    }

    #[tokio::test]
    async fn distinct_users_do_not_collide() {
        let store = Arc::new(MemoryStore::new());
        let queue = JobQueue::new(store, QueueMode::Queue);

        queue.enqueue(sync_payload(Uuid::new_v4())).await.unwrap();
        queue.enqueue(sync_payload(Uuid::new_v4())).await.unwrap();

        let counts = queue.stats(QueueName::Sync).await.unwrap();
        assert_eq!(counts.waiting, 2);
    }

    #[tokio::test]
    async fn completed_job_does_not_absorb_new_enqueues() {
        let store = Arc::new(MemoryStore::new());
        let queue = JobQueue::new(store.clone(), QueueMode::Queue);
        let user_id = Uuid::new_v4();

        let first = queue.enqueue(sync_payload(user_id)).await.unwrap();
        store.mark_job_completed(first.job_id).await.unwrap();

        let second = queue.enqueue(sync_payload(user_id)).await.unwrap();
        assert!(!second.duplicate);
        assert_ne!(second.job_id, first.job_id);
    }

    #[tokio::test]
    async fn inline_mode_runs_and_completes_the_job() {
        let store = Arc::new(MemoryStore::new());
        let queue = JobQueue::new(store.clone(), QueueMode::Inline);
        queue.install_inline_executor(|_job| Box::pin(async { Ok(()) }));

        let receipt = queue.enqueue(sync_payload(Uuid::new_v4())).await.unwrap();

        assert_eq!(receipt.mode, "inline");
        assert_eq!(store.job_status(receipt.job_id), Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn inline_failure_is_recorded_not_propagated() {
        let store = Arc::new(MemoryStore::new());
        let queue = JobQueue::new(store.clone(), QueueMode::Inline);
        queue.install_inline_executor(|_job| {
            Box::pin(async { Err(anyhow::anyhow!("handler blew up")) })
        });

        let receipt = queue.enqueue(sync_payload(Uuid::new_v4())).await.unwrap();

        assert!(!receipt.duplicate);
        assert_eq!(store.job_status(receipt.job_id), Some(JobStatus::Failed));
    }
}
