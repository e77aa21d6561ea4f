use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;

use crate::domains::agents::{run_agent_task, AgentKind};
use crate::domains::classification::ClassificationPipeline;
use crate::domains::extraction::ExtractionPoller;
use crate::domains::sync::run_sync;
use crate::kernel::deps::EngineDeps;

use super::job::{Job, JobPayload, QueueName};

type Handler =
    Box<dyn Fn(Job, Arc<EngineDeps>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Maps each queue to its handler. Both the worker runtime and the inline
/// executor dispatch through here.
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<QueueName, Handler>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, queue: QueueName, handler: F)
    where
        F: Fn(Job, Arc<EngineDeps>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        self.handlers.insert(queue, Box::new(handler));
    }

    pub fn handles(&self, queue: QueueName) -> bool {
        self.handlers.contains_key(&queue)
    }

    pub async fn run(&self, job: Job, deps: Arc<EngineDeps>) -> Result<()> {
        let handler = self
            .handlers
            .get(&job.queue)
            .ok_or_else(|| anyhow!("no handler registered for queue {}", job.queue))?;
        handler(job, deps).await
    }

    /// The production wiring: every queue mapped to its domain handler.
    pub fn standard() -> Self {
        let mut registry = Self::new();

        registry.register(QueueName::Sync, |job, deps| {
            Box::pin(async move {
                let JobPayload::Sync { user_id, full } = job.payload else {
                    return Err(anyhow!("sync queue received {} payload", job.queue));
                };
                run_sync(&deps, user_id, full).await?;
                Ok(())
            })
        });

        registry.register(QueueName::Classification, |job, deps| {
            Box::pin(async move {
                let JobPayload::Classification { message_id, .. } = job.payload else {
                    return Err(anyhow!("classification queue received {} payload", job.queue));
                };
                ClassificationPipeline::new(
                    deps.store.clone(),
                    deps.model.clone(),
                    deps.retry.clone(),
                    deps.settings.primary_model.clone(),
                    deps.settings.fallback_model.clone(),
                )
                .classify_message(message_id)
                .await?;
                Ok(())
            })
        });

        registry.register(QueueName::AgentTasks, |job, deps| {
            Box::pin(async move {
                let JobPayload::AgentTask {
                    kind,
                    message_id,
                    user_id,
                } = job.payload
                else {
                    return Err(anyhow!("agent queue received {} payload", job.queue));
                };
                run_agent_task(&deps, kind, message_id, user_id).await
            })
        });

        registry.register(QueueName::Extraction, |job, deps| {
            Box::pin(async move {
                let JobPayload::Extraction {
                    document_id,
                    user_id,
                } = job.payload
                else {
                    return Err(anyhow!("extraction queue received {} payload", job.queue));
                };
                ExtractionPoller::new(deps.extraction.clone(), deps.store.clone(), deps.retry.clone())
                    .run(document_id)
                    .await?;

                // Successful extraction feeds a summary of the parent message.
                if let Some(document) = deps.store.get_document(document_id).await? {
                    deps.queue
                        .enqueue(JobPayload::AgentTask {
                            kind: AgentKind::Summarizer,
                            message_id: document.message_id,
                            user_id,
                        })
                        .await?;
                }
                Ok(())
            })
        });

        registry.register(QueueName::DeadLetter, |job, _deps| {
            Box::pin(async move {
                let JobPayload::DeadLetter {
                    original_queue,
                    attempts_made,
                    failed_reason,
                    ..
                } = &job.payload
                else {
                    return Err(anyhow!("dead-letter queue received {} payload", job.queue));
                };
                // Terminal record; surfaced for operators, nothing to execute.
                tracing::error!(
                    original_queue = %original_queue,
                    attempts_made,
                    reason = %failed_reason,
                    "job dead-lettered"
                );
                Ok(())
            })
        });

        registry
    }
}
