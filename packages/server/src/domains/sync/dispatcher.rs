//! Sync execution: one job per user at a time, cursor advanced only after a
//! fully processed batch.

use std::sync::Arc;

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::domains::extraction::DocumentRecord;
use crate::kernel::deps::EngineDeps;
use crate::kernel::jobs::{EnqueueReceipt, JobPayload, JobQueue};
use crate::kernel::traits::{ChangeBatch, FetchedMessage};

use super::models::MailMessage;

/// Upper bound on messages pulled by a full sync.
pub const FULL_SYNC_MESSAGE_LIMIT: usize = 500;

const EXTRACTABLE_MIME: &str = "application/pdf";

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub user_id: Uuid,
    pub synced: usize,
    pub deleted: usize,
    /// True when another sync already held the per-user lock.
    pub skipped: bool,
    pub cursor: Option<String>,
}

impl SyncOutcome {
    fn skipped(user_id: Uuid) -> Self {
        Self {
            user_id,
            synced: 0,
            deleted: 0,
            skipped: true,
            cursor: None,
        }
    }
}

/// Submission side: everything that wants a sync (webhook, poller, manual
/// trigger) goes through here. The dedupe key collapses concurrent requests
/// for the same user onto one queued job.
pub struct SyncDispatcher {
    queue: Arc<JobQueue>,
}

impl SyncDispatcher {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self { queue }
    }

    pub async fn dispatch(&self, user_id: Uuid, full: bool) -> Result<EnqueueReceipt> {
        self.queue.enqueue(JobPayload::Sync { user_id, full }).await
    }
}

/// Worker body for sync jobs.
///
/// A lost idle->syncing race is a clean skip, not a failure; the holder of
/// the lock is doing the same work. Any error mid-batch records the error
/// state and leaves the cursor where it was, so the retried job replays from
/// the same position.
pub async fn run_sync(deps: &EngineDeps, user_id: Uuid, full: bool) -> Result<SyncOutcome> {
    let cursor = deps.store.get_cursor(user_id).await?;
    if !deps.store.try_begin_sync(user_id).await? {
        tracing::debug!(user_id = %user_id, "sync already in flight, skipping");
        return Ok(SyncOutcome::skipped(user_id));
    }

    let full_sync = full || cursor.history_id.is_none();
    match process_batch(deps, user_id, full_sync, cursor.history_id.as_deref()).await {
        Ok(outcome) => {
            tracing::info!(
                user_id = %user_id,
                synced = outcome.synced,
                deleted = outcome.deleted,
                full_sync,
                "sync completed"
            );
            Ok(outcome)
        }
        Err(e) => {
            deps.store.fail_sync(user_id, &e.to_string()).await?;
            Err(e)
        }
    }
}

async fn process_batch(
    deps: &EngineDeps,
    user_id: Uuid,
    full_sync: bool,
    history_id: Option<&str>,
) -> Result<SyncOutcome> {
    let batch: ChangeBatch = if full_sync {
        deps.retry
            .execute(|| deps.mailbox.list_recent(user_id, deps.settings.full_sync_limit))
            .await
            .context("full message listing failed")?
    } else {
        // history_id is present whenever full_sync is false.
        let cursor = history_id.unwrap_or_default();
        deps.retry
            .execute(|| deps.mailbox.list_changes_since(user_id, cursor))
            .await
            .context("change listing failed")?
    };

    let mut synced = 0usize;
    for message_ref in &batch.added {
        ingest_message(deps, user_id, &message_ref.provider_id).await?;
        synced += 1;
    }

    let mut deleted = 0usize;
    for provider_id in &batch.deleted {
        deps.store
            .delete_message_by_provider_id(user_id, provider_id)
            .await?;
        deleted += 1;
    }

    deps.store
        .complete_sync(user_id, &batch.latest_cursor, synced as i64)
        .await?;

    Ok(SyncOutcome {
        user_id,
        synced,
        deleted,
        skipped: false,
        cursor: Some(batch.latest_cursor),
    })
}

/// Fetch, persist, and fan out one message: classification when none exists
/// yet, extraction per PDF attachment.
async fn ingest_message(deps: &EngineDeps, user_id: Uuid, provider_id: &str) -> Result<()> {
    let fetched = deps
        .retry
        .execute(|| deps.mailbox.fetch_message(user_id, provider_id))
        .await
        .with_context(|| format!("message fetch failed: {provider_id}"))?;

    let message = to_record(user_id, &fetched);
    let message_id = deps.store.upsert_message(&message).await?;

    if deps.store.get_classification(message_id).await?.is_none() {
        deps.queue
            .enqueue(JobPayload::Classification {
                message_id,
                user_id,
            })
            .await?;
    }

    for attachment in &fetched.attachments {
        if attachment.mime_type != EXTRACTABLE_MIME {
            continue;
        }
        let bytes = deps
            .retry
            .execute(|| {
                deps.mailbox
                    .fetch_attachment(user_id, provider_id, &attachment.attachment_id)
            })
            .await
            .with_context(|| format!("attachment fetch failed: {}", attachment.filename))?;

        let path = format!("{user_id}/{provider_id}/{}", attachment.filename);
        let source_ref = deps
            .retry
            .execute(|| {
                deps.extraction
                    .store_source(&path, &bytes, &attachment.mime_type)
            })
            .await
            .context("attachment upload failed")?;

        let document = DocumentRecord::builder()
            .user_id(user_id)
            .message_id(message_id)
            .filename(attachment.filename.clone())
            .mime_type(attachment.mime_type.clone())
            .source_ref(source_ref)
            .build();
        let document_id = document.id;
        deps.store.insert_document(&document).await?;
        deps.queue
            .enqueue(JobPayload::Extraction {
                document_id,
                user_id,
            })
            .await?;
    }

    Ok(())
}

fn to_record(user_id: Uuid, fetched: &FetchedMessage) -> MailMessage {
    MailMessage::builder()
        .user_id(user_id)
        .provider_id(fetched.provider_id.clone())
        .thread_id(fetched.thread_id.clone())
        .subject(fetched.subject.clone())
        .from_email(fetched.from_email.clone())
        .to_email(fetched.to_email.clone())
        .body(fetched.body.clone())
        .snippet(fetched.snippet.clone())
        .has_attachments(!fetched.attachments.is_empty())
        .labels(fetched.labels.clone())
        .received_at(fetched.received_at)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::sync::SyncStatus;
    use crate::kernel::jobs::{QueueMode, QueueName};
    use crate::kernel::test_dependencies::{MockMailbox, TestEngine};
    use crate::kernel::traits::{AttachmentRef, MessageRef};
    use crate::store::RecordStore;

    fn batch(ids: &[&str], cursor: &str) -> ChangeBatch {
        ChangeBatch {
            added: ids
                .iter()
                .map(|id| MessageRef {
                    provider_id: id.to_string(),
                })
                .collect(),
            deleted: Vec::new(),
            latest_cursor: cursor.to_string(),
        }
    }

    #[tokio::test]
    async fn first_sync_is_full_and_sets_cursor() {
        let mailbox = MockMailbox::new().with_recent(batch(&["m-1", "m-2"], "h-5"));
        let engine = TestEngine::with_mailbox(QueueMode::Queue, mailbox);
        let user_id = Uuid::new_v4();

        let outcome = run_sync(&engine.deps, user_id, false).await.unwrap();

        assert_eq!(outcome.synced, 2);
        assert!(!outcome.skipped);
        // No cursor existed, so the incremental listing was never consulted.
        assert!(engine.mailbox.cursor_calls().is_empty());

        let cursor = engine.deps.store.get_cursor(user_id).await.unwrap();
        assert_eq!(cursor.history_id.as_deref(), Some("h-5"));
        assert_eq!(cursor.status, SyncStatus::Idle);
        assert_eq!(cursor.total_synced, 2);
        assert_eq!(engine.store.message_count(user_id), 2);
    }

    #[tokio::test]
    async fn incremental_sync_resumes_from_cursor() {
        let mailbox = MockMailbox::new().with_changes(batch(&["m-3"], "h-9"));
        let engine = TestEngine::with_mailbox(QueueMode::Queue, mailbox);
        let user_id = Uuid::new_v4();

        engine.deps.store.try_begin_sync(user_id).await.unwrap();
        engine
            .deps
            .store
            .complete_sync(user_id, "h-5", 0)
            .await
            .unwrap();

        run_sync(&engine.deps, user_id, false).await.unwrap();

        assert_eq!(engine.mailbox.cursor_calls(), vec!["h-5".to_string()]);
        let cursor = engine.deps.store.get_cursor(user_id).await.unwrap();
        assert_eq!(cursor.history_id.as_deref(), Some("h-9"));
    }

    #[tokio::test]
    async fn replayed_batch_creates_no_duplicates() {
        let mailbox = MockMailbox::new()
            .with_changes(batch(&["m-1"], "h-6"))
            .with_changes(batch(&["m-1"], "h-6"));
        let engine = TestEngine::with_mailbox(QueueMode::Queue, mailbox);
        let user_id = Uuid::new_v4();

        engine.deps.store.try_begin_sync(user_id).await.unwrap();
        engine
            .deps
            .store
            .complete_sync(user_id, "h-5", 0)
            .await
            .unwrap();

        run_sync(&engine.deps, user_id, false).await.unwrap();
        run_sync(&engine.deps, user_id, false).await.unwrap();

        assert_eq!(engine.store.message_count(user_id), 1);
        // Second pass found the first classification job still pending.
        let counts = engine
            .deps
            .queue
            .stats(QueueName::Classification)
            .await
            .unwrap();
        assert_eq!(counts.waiting, 1);
    }

    #[tokio::test]
    async fn mid_batch_failure_leaves_cursor_untouched() {
        let mailbox = MockMailbox::new()
            .with_changes(batch(&["m-1", "m-2"], "h-9"))
            .failing_fetch("m-2");
        let engine = TestEngine::with_mailbox(QueueMode::Queue, mailbox);
        let user_id = Uuid::new_v4();

        engine.deps.store.try_begin_sync(user_id).await.unwrap();
        engine
            .deps
            .store
            .complete_sync(user_id, "h-5", 0)
            .await
            .unwrap();

        let result = run_sync(&engine.deps, user_id, false).await;
        assert!(result.is_err());

        let cursor = engine.deps.store.get_cursor(user_id).await.unwrap();
        assert_eq!(cursor.history_id.as_deref(), Some("h-5"));
        assert_eq!(cursor.status, SyncStatus::Error);
        assert!(cursor.error_message.is_some());
    }

    #[tokio::test]
    async fn concurrent_sync_is_skipped() {
        let engine = TestEngine::new(QueueMode::Queue);
        let user_id = Uuid::new_v4();

        engine.deps.store.try_begin_sync(user_id).await.unwrap();
        let outcome = run_sync(&engine.deps, user_id, false).await.unwrap();

        assert!(outcome.skipped);
        assert_eq!(outcome.synced, 0);
    }

    #[tokio::test]
    async fn deletions_remove_stored_messages() {
        let mailbox = MockMailbox::new().with_changes(ChangeBatch {
            added: Vec::new(),
            deleted: vec!["m-1".to_string()],
            latest_cursor: "h-7".to_string(),
        });
        let engine = TestEngine::with_mailbox(QueueMode::Queue, mailbox);
        let user_id = Uuid::new_v4();

        let message = MailMessage::builder()
            .user_id(user_id)
            .provider_id("m-1")
            .build();
        engine.store.upsert_message(&message).await.unwrap();
        engine.deps.store.try_begin_sync(user_id).await.unwrap();
        engine
            .deps
            .store
            .complete_sync(user_id, "h-5", 0)
            .await
            .unwrap();

        let outcome = run_sync(&engine.deps, user_id, false).await.unwrap();

        assert_eq!(outcome.deleted, 1);
        assert_eq!(engine.store.message_count(user_id), 0);
    }

    #[tokio::test]
    async fn pdf_attachment_stages_an_extraction_job() {
        let fetched = FetchedMessage {
            provider_id: "m-1".to_string(),
            subject: "Contract attached".to_string(),
            from_email: "sender@example.com".to_string(),
            attachments: vec![
                AttachmentRef {
                    filename: "contract.pdf".to_string(),
                    mime_type: "application/pdf".to_string(),
                    attachment_id: "att-1".to_string(),
                },
                AttachmentRef {
                    filename: "photo.png".to_string(),
                    mime_type: "image/png".to_string(),
                    attachment_id: "att-2".to_string(),
                },
            ],
            ..FetchedMessage::default()
        };
        let mailbox = MockMailbox::new()
            .with_recent(batch(&["m-1"], "h-5"))
            .with_message(fetched)
            .with_attachment("att-1", vec![0x25, 0x50, 0x44, 0x46]);
        let engine = TestEngine::with_mailbox(QueueMode::Queue, mailbox);
        let user_id = Uuid::new_v4();

        run_sync(&engine.deps, user_id, false).await.unwrap();

        // Only the PDF was staged.
        assert_eq!(engine.extraction.stored_sources().len(), 1);
        let counts = engine.deps.queue.stats(QueueName::Extraction).await.unwrap();
        assert_eq!(counts.waiting, 1);

        let message = engine
            .store
            .find_message_by_provider_id(user_id, "m-1")
            .unwrap();
        assert!(message.has_attachments);
        let documents = engine
            .deps
            .store
            .documents_for_message(message.id)
            .await
            .unwrap();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].filename, "contract.pdf");
    }

    #[tokio::test]
    async fn dispatcher_collapses_duplicate_requests() {
        let engine = TestEngine::new(QueueMode::Queue);
        let dispatcher = SyncDispatcher::new(engine.deps.queue.clone());
        let user_id = Uuid::new_v4();

        let first = dispatcher.dispatch(user_id, false).await.unwrap();
        let second = dispatcher.dispatch(user_id, true).await.unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(second.job_id, first.job_id);
    }
}
