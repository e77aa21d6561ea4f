//! In-memory [`RecordStore`] used by tests and single-process development
//! runs. Same observable semantics as the Postgres store, including the
//! cursor compare-and-set and exclusive job claims.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domains::agents::AgentOutput;
use crate::domains::classification::ClassificationResult;
use crate::domains::extraction::{DocumentRecord, ExtractionStatus};
use crate::domains::sync::{MailMessage, SyncCursor, SyncPreference, SyncStatus};
use crate::domains::watch::{WatchState, WatchSubscription};
use crate::kernel::jobs::{Job, JobStatus, QueueCounts, QueueName};

use super::{RecordStore, UserRecord};

#[derive(Default)]
struct Inner {
    users: Vec<UserRecord>,
    cursors: HashMap<Uuid, SyncCursor>,
    messages: HashMap<Uuid, MailMessage>,
    classifications: HashMap<Uuid, ClassificationResult>,
    watches: HashMap<Uuid, WatchSubscription>,
    preferences: HashMap<Uuid, SyncPreference>,
    documents: HashMap<Uuid, DocumentRecord>,
    agent_outputs: HashMap<(Uuid, &'static str), AgentOutput>,
    jobs: HashMap<Uuid, Job>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens after a panic in another test thread.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_user(&self, email: &str) -> UserRecord {
        let user = UserRecord {
            id: Uuid::new_v4(),
            email: email.to_string(),
        };
        self.lock().users.push(user.clone());
        user
    }

    pub fn set_preferences(&self, preference: SyncPreference) {
        self.lock()
            .preferences
            .insert(preference.user_id, preference);
    }

    pub fn message_count(&self, user_id: Uuid) -> usize {
        self.lock()
            .messages
            .values()
            .filter(|m| m.user_id == user_id)
            .count()
    }

    pub fn find_message_by_provider_id(
        &self,
        user_id: Uuid,
        provider_id: &str,
    ) -> Option<MailMessage> {
        self.lock()
            .messages
            .values()
            .find(|m| m.user_id == user_id && m.provider_id == provider_id)
            .cloned()
    }

    pub fn classification_count(&self, message_id: Uuid) -> usize {
        usize::from(self.lock().classifications.contains_key(&message_id))
    }

    pub fn agent_output(&self, message_id: Uuid, kind: &str) -> Option<AgentOutput> {
        self.lock()
            .agent_outputs
            .values()
            .find(|o| o.message_id == message_id && o.kind.as_str() == kind)
            .cloned()
    }

    pub fn job_status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.lock().jobs.get(&job_id).map(|j| j.status)
    }

    /// Pull every delayed job's `run_at` into the past so tests can claim
    /// retries without sleeping out the backoff.
    pub fn make_delayed_jobs_due(&self) {
        let past = Utc::now() - chrono::Duration::seconds(1);
        for job in self.lock().jobs.values_mut() {
            if job.status == JobStatus::Delayed {
                job.run_at = past;
            }
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        Ok(self
            .lock()
            .users
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn get_cursor(&self, user_id: Uuid) -> Result<SyncCursor> {
        Ok(self
            .lock()
            .cursors
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| SyncCursor::empty(user_id)))
    }

    async fn try_begin_sync(&self, user_id: Uuid) -> Result<bool> {
        let mut inner = self.lock();
        let cursor = inner
            .cursors
            .entry(user_id)
            .or_insert_with(|| SyncCursor::empty(user_id));
        if cursor.status == SyncStatus::Syncing {
            return Ok(false);
        }
        cursor.status = SyncStatus::Syncing;
        Ok(true)
    }

    async fn complete_sync(
        &self,
        user_id: Uuid,
        latest_cursor: &str,
        newly_synced: i64,
    ) -> Result<()> {
        let mut inner = self.lock();
        let cursor = inner
            .cursors
            .entry(user_id)
            .or_insert_with(|| SyncCursor::empty(user_id));
        cursor.history_id = Some(latest_cursor.to_string());
        cursor.last_sync_at = Some(Utc::now());
        cursor.status = SyncStatus::Idle;
        cursor.error_message = None;
        cursor.total_synced += newly_synced;
        Ok(())
    }

    async fn fail_sync(&self, user_id: Uuid, error: &str) -> Result<()> {
        let mut inner = self.lock();
        let cursor = inner
            .cursors
            .entry(user_id)
            .or_insert_with(|| SyncCursor::empty(user_id));
        cursor.status = SyncStatus::Error;
        cursor.error_message = Some(error.to_string());
        Ok(())
    }

    async fn upsert_message(&self, message: &MailMessage) -> Result<Uuid> {
        let mut inner = self.lock();
        let existing_id = inner
            .messages
            .values()
            .find(|m| m.user_id == message.user_id && m.provider_id == message.provider_id)
            .map(|m| m.id);
        let id = existing_id.unwrap_or(message.id);
        let mut row = message.clone();
        row.id = id;
        inner.messages.insert(id, row);
        Ok(id)
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<MailMessage>> {
        Ok(self.lock().messages.get(&id).cloned())
    }

    async fn delete_message_by_provider_id(&self, user_id: Uuid, provider_id: &str) -> Result<()> {
        let mut inner = self.lock();
        let found = inner
            .messages
            .values()
            .find(|m| m.user_id == user_id && m.provider_id == provider_id)
            .map(|m| m.id);
        if let Some(id) = found {
            inner.messages.remove(&id);
            inner.classifications.remove(&id);
        }
        Ok(())
    }

    async fn get_classification(&self, message_id: Uuid) -> Result<Option<ClassificationResult>> {
        Ok(self.lock().classifications.get(&message_id).cloned())
    }

    async fn upsert_classification(&self, result: &ClassificationResult) -> Result<()> {
        self.lock()
            .classifications
            .insert(result.message_id, result.clone());
        Ok(())
    }

    async fn get_watch(&self, user_id: Uuid) -> Result<Option<WatchSubscription>> {
        Ok(self.lock().watches.get(&user_id).cloned())
    }

    async fn upsert_watch(&self, watch: &WatchSubscription) -> Result<()> {
        self.lock().watches.insert(watch.user_id, watch.clone());
        Ok(())
    }

    async fn mark_watch_inactive(&self, user_id: Uuid) -> Result<()> {
        if let Some(watch) = self.lock().watches.get_mut(&user_id) {
            watch.state = WatchState::Inactive;
            watch.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_watch_failure(&self, user_id: Uuid, error: &str) -> Result<()> {
        if let Some(watch) = self.lock().watches.get_mut(&user_id) {
            watch.state = WatchState::Inactive;
            watch.last_error = Some(error.to_string());
            watch.renewal_attempts += 1;
            watch.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn touch_watch_notification(&self, user_id: Uuid) -> Result<()> {
        if let Some(watch) = self.lock().watches.get_mut(&user_id) {
            watch.last_notified_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn expiring_watches(&self, before: DateTime<Utc>) -> Result<Vec<WatchSubscription>> {
        Ok(self
            .lock()
            .watches
            .values()
            .filter(|w| w.is_active() && w.expires_at <= before)
            .cloned()
            .collect())
    }

    async fn get_preferences(&self, user_id: Uuid) -> Result<SyncPreference> {
        Ok(self
            .lock()
            .preferences
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| SyncPreference::builder().user_id(user_id).build()))
    }

    async fn auto_sync_users(&self) -> Result<Vec<SyncPreference>> {
        Ok(self
            .lock()
            .preferences
            .values()
            .filter(|p| p.auto_sync_enabled)
            .cloned()
            .collect())
    }

    async fn insert_document(&self, document: &DocumentRecord) -> Result<()> {
        self.lock().documents.insert(document.id, document.clone());
        Ok(())
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<DocumentRecord>> {
        Ok(self.lock().documents.get(&id).cloned())
    }

    async fn documents_for_message(&self, message_id: Uuid) -> Result<Vec<DocumentRecord>> {
        Ok(self
            .lock()
            .documents
            .values()
            .filter(|d| d.message_id == message_id)
            .cloned()
            .collect())
    }

    async fn set_document_processing(&self, id: Uuid) -> Result<()> {
        if let Some(doc) = self.lock().documents.get_mut(&id) {
            doc.status = ExtractionStatus::Processing;
            doc.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_document_done(&self, id: Uuid, text: &str) -> Result<()> {
        if let Some(doc) = self.lock().documents.get_mut(&id) {
            doc.status = ExtractionStatus::Done;
            doc.extracted_text = Some(text.to_string());
            doc.error_message = None;
            doc.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_document_error(&self, id: Uuid, error: &str) -> Result<()> {
        if let Some(doc) = self.lock().documents.get_mut(&id) {
            doc.status = ExtractionStatus::Error;
            doc.error_message = Some(error.to_string());
            doc.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn save_agent_output(&self, output: &AgentOutput) -> Result<()> {
        self.lock()
            .agent_outputs
            .insert((output.message_id, output.kind.as_str()), output.clone());
        Ok(())
    }

    async fn insert_job(&self, job: &Job) -> Result<()> {
        self.lock().jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn find_active_job(&self, dedupe_key: &str) -> Result<Option<Job>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .find(|j| {
                j.dedupe_key.as_deref() == Some(dedupe_key)
                    && matches!(
                        j.status,
                        JobStatus::Waiting | JobStatus::Active | JobStatus::Delayed
                    )
            })
            .cloned())
    }

    async fn claim_jobs(&self, queue: QueueName, limit: i64) -> Result<Vec<Job>> {
        let now = Utc::now();
        let mut inner = self.lock();
        let mut due: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| {
                j.queue == queue
                    && match j.status {
                        JobStatus::Waiting => true,
                        JobStatus::Delayed => j.run_at <= now,
                        _ => false,
                    }
            })
            .map(|j| j.id)
            .collect();
        due.sort_by_key(|id| inner.jobs[id].enqueued_at);
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.status = JobStatus::Active;
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_job_completed(&self, job_id: Uuid) -> Result<()> {
        if let Some(job) = self.lock().jobs.get_mut(&job_id) {
            job.status = JobStatus::Completed;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn requeue_job(&self, job_id: Uuid, run_at: DateTime<Utc>, error: &str) -> Result<()> {
        if let Some(job) = self.lock().jobs.get_mut(&job_id) {
            job.status = JobStatus::Delayed;
            job.attempt += 1;
            job.run_at = run_at;
            job.error_message = Some(error.to_string());
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_job_failed(&self, job_id: Uuid, error: &str) -> Result<()> {
        if let Some(job) = self.lock().jobs.get_mut(&job_id) {
            job.status = JobStatus::Failed;
            job.error_message = Some(error.to_string());
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn queue_counts(&self, queue: QueueName) -> Result<QueueCounts> {
        let mut counts = QueueCounts::default();
        for job in self.lock().jobs.values().filter(|j| j.queue == queue) {
            match job.status {
                JobStatus::Waiting => counts.waiting += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Delayed => counts.delayed += 1,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_message_is_idempotent_by_provider_id() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let message = MailMessage::builder()
            .user_id(user_id)
            .provider_id("gm-1")
            .subject("first")
            .build();

        let id1 = store.upsert_message(&message).await.unwrap();
        let mut replay = message.clone();
        replay.id = Uuid::new_v4();
        replay.subject = "updated".into();
        let id2 = store.upsert_message(&replay).await.unwrap();

        assert_eq!(id1, id2);
        assert_eq!(store.message_count(user_id), 1);
        assert_eq!(
            store.get_message(id1).await.unwrap().unwrap().subject,
            "updated"
        );
    }

    #[tokio::test]
    async fn begin_sync_cas_excludes_concurrent_sync() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();

        assert!(store.try_begin_sync(user_id).await.unwrap());
        assert!(!store.try_begin_sync(user_id).await.unwrap());

        store.complete_sync(user_id, "h-10", 3).await.unwrap();
        assert!(store.try_begin_sync(user_id).await.unwrap());
    }

    #[tokio::test]
    async fn failed_sync_keeps_cursor_position() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();

        store.try_begin_sync(user_id).await.unwrap();
        store.complete_sync(user_id, "h-10", 1).await.unwrap();
        store.try_begin_sync(user_id).await.unwrap();
        store.fail_sync(user_id, "mailbox unreachable").await.unwrap();

        let cursor = store.get_cursor(user_id).await.unwrap();
        assert_eq!(cursor.history_id.as_deref(), Some("h-10"));
        assert_eq!(cursor.status, SyncStatus::Error);
        // An errored cursor can be re-acquired.
        assert!(store.try_begin_sync(user_id).await.unwrap());
    }

    #[tokio::test]
    async fn claim_respects_queue_order_and_limit() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            let job = Job::new(crate::kernel::jobs::JobPayload::Classification {
                message_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
            });
            store.insert_job(&job).await.unwrap();
        }

        let first = store.claim_jobs(QueueName::Classification, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let second = store.claim_jobs(QueueName::Classification, 2).await.unwrap();
        assert_eq!(second.len(), 1);
        // All claimed jobs are now active and unclaimable.
        assert!(store
            .claim_jobs(QueueName::Classification, 2)
            .await
            .unwrap()
            .is_empty());
    }
}
