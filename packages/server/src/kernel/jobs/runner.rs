use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::kernel::deps::EngineDeps;

use super::job::{Job, JobPayload, QueueName};
use super::registry::JobRegistry;

/// How long an idle worker sleeps before polling its queue again.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Owns the worker pools that drain the queues.
///
/// Startup is explicit and idempotent: callers that need workers running
/// invoke [`WorkerRuntime::ensure_started`]; only the first call spawns
/// anything. No ambient auto-start on first enqueue.
pub struct WorkerRuntime {
    deps: Arc<EngineDeps>,
    registry: Arc<JobRegistry>,
    started: AtomicBool,
    cancel: CancellationToken,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerRuntime {
    pub fn new(deps: Arc<EngineDeps>, registry: Arc<JobRegistry>) -> Self {
        Self {
            deps,
            registry,
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            handles: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Spawn the per-queue worker pools. Safe to call from multiple places;
    /// only the winner of the flag spawns.
    pub async fn ensure_started(&self) {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let mut handles = self.handles.lock().await;
        for queue in QueueName::ALL {
            for worker in 0..queue.concurrency() {
                let deps = self.deps.clone();
                let registry = self.registry.clone();
                let cancel = self.cancel.clone();
                handles.push(tokio::spawn(async move {
                    worker_loop(queue, worker, deps, registry, cancel).await;
                }));
            }
            tracing::info!(
                queue = %queue,
                concurrency = queue.concurrency(),
                "worker pool started"
            );
        }
    }

    /// Stop claiming new jobs and wait for in-flight handlers to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "worker task panicked during shutdown");
            }
        }
        tracing::info!("worker runtime stopped");
    }
}

async fn worker_loop(
    queue: QueueName,
    worker: usize,
    deps: Arc<EngineDeps>,
    registry: Arc<JobRegistry>,
    cancel: CancellationToken,
) {
    loop {
        let claimed = match deps.store.claim_jobs(queue, 1).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(queue = %queue, worker, error = %e, "job claim failed");
                Vec::new()
            }
        };

        if claimed.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(IDLE_POLL) => continue,
            }
        }

        for job in claimed {
            if let Err(e) = execute_one(job, &deps, &registry).await {
                tracing::error!(queue = %queue, worker, error = %e, "job bookkeeping failed");
            }
        }

        if cancel.is_cancelled() {
            return;
        }
    }
}

/// Run one claimed job and record the outcome: completed, delayed for a
/// retry, or failed with a dead-letter record.
async fn execute_one(
    job: Job,
    deps: &Arc<EngineDeps>,
    registry: &Arc<JobRegistry>,
) -> Result<()> {
    let job_id = job.id;
    let queue = job.queue;
    let attempt = job.attempt;

    match registry.run(job.clone(), deps.clone()).await {
        Ok(()) => {
            tracing::debug!(queue = %queue, job_id = %job_id, attempt, "job completed");
            deps.store.mark_job_completed(job_id).await
        }
        Err(e) if job.attempts_remaining() => {
            let delay = chrono::Duration::seconds(2i64.saturating_pow(attempt as u32));
            tracing::warn!(
                queue = %queue,
                job_id = %job_id,
                attempt,
                delay_secs = delay.num_seconds(),
                error = %e,
                "job failed, scheduling retry"
            );
            deps.store
                .requeue_job(job_id, Utc::now() + delay, &e.to_string())
                .await
        }
        Err(e) => {
            tracing::error!(
                queue = %queue,
                job_id = %job_id,
                attempt,
                error = %e,
                "job exhausted its attempts"
            );
            deps.store.mark_job_failed(job_id, &e.to_string()).await?;
            if queue != QueueName::DeadLetter {
                deps.queue
                    .enqueue(JobPayload::DeadLetter {
                        original_queue: queue,
                        payload: serde_json::to_value(&job.payload)?,
                        attempts_made: attempt,
                        failed_reason: e.to_string(),
                    })
                    .await?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::sync::MailMessage;
    use crate::kernel::jobs::{JobStatus, QueueMode};
    use crate::kernel::test_dependencies::TestEngine;
    use crate::store::RecordStore;
    use uuid::Uuid;

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn ensure_started_is_idempotent() {
        let engine = TestEngine::new(QueueMode::Queue);
        let runtime = WorkerRuntime::new(engine.deps.clone(), Arc::new(JobRegistry::standard()));

        runtime.ensure_started().await;
        runtime.ensure_started().await;
        assert!(runtime.is_started());

        let expected: usize = QueueName::ALL.iter().map(|q| q.concurrency()).sum();
        assert_eq!(runtime.handles.lock().await.len(), expected);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn claimed_job_runs_to_completion() {
        let engine = TestEngine::new(QueueMode::Queue);
        let message = MailMessage::builder()
            .user_id(Uuid::new_v4())
            .provider_id("m-1")
            .subject("Invoice #9 payment due")
            .build();
        let message_id = engine.store.upsert_message(&message).await.unwrap();

        let receipt = engine
            .deps
            .queue
            .enqueue(JobPayload::Classification {
                message_id,
                user_id: message.user_id,
            })
            .await
            .unwrap();

        let runtime = WorkerRuntime::new(engine.deps.clone(), Arc::new(JobRegistry::standard()));
        runtime.ensure_started().await;

        let store = engine.store.clone();
        wait_for(|| store.job_status(receipt.job_id) == Some(JobStatus::Completed)).await;
        assert!(store
            .get_classification(message_id)
            .await
            .unwrap()
            .is_some());

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_job_lands_in_dead_letter() {
        let engine = TestEngine::new(QueueMode::Queue);
        // No message row behind this id, so every attempt fails.
        let receipt = engine
            .deps
            .queue
            .enqueue(JobPayload::Classification {
                message_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
            })
            .await
            .unwrap();

        // Claim and execute by hand to avoid waiting out the retry delays.
        let registry = Arc::new(JobRegistry::standard());
        for _ in 0..3 {
            let mut jobs = engine
                .store
                .claim_jobs(QueueName::Classification, 1)
                .await
                .unwrap();
            if jobs.is_empty() {
                engine.store.make_delayed_jobs_due();
                jobs = engine
                    .store
                    .claim_jobs(QueueName::Classification, 1)
                    .await
                    .unwrap();
            }
            let job = jobs.into_iter().next().unwrap();
            execute_one(job, &engine.deps, &registry).await.unwrap();
        }

        assert_eq!(
            engine.store.job_status(receipt.job_id),
            Some(JobStatus::Failed)
        );
        let dead = engine
            .deps
            .queue
            .stats(QueueName::DeadLetter)
            .await
            .unwrap();
        assert_eq!(dead.waiting, 1);
    }

    #[tokio::test]
    async fn retry_is_parked_as_delayed() {
        let engine = TestEngine::new(QueueMode::Queue);
        let receipt = engine
            .deps
            .queue
            .enqueue(JobPayload::Classification {
                message_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
            })
            .await
            .unwrap();

        let registry = Arc::new(JobRegistry::standard());
        let job = engine
            .store
            .claim_jobs(QueueName::Classification, 1)
            .await
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        execute_one(job, &engine.deps, &registry).await.unwrap();

        assert_eq!(
            engine.store.job_status(receipt.job_id),
            Some(JobStatus::Delayed)
        );
        // Not due yet, so it cannot be claimed.
        assert!(engine
            .store
            .claim_jobs(QueueName::Classification, 1)
            .await
            .unwrap()
            .is_empty());
    }
}
