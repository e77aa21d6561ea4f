//! Persistence seam. The engine talks to storage through [`RecordStore`];
//! production wires Postgres, tests wire the in-memory store.

mod memory;
mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domains::agents::AgentOutput;
use crate::domains::classification::ClassificationResult;
use crate::domains::extraction::DocumentRecord;
use crate::domains::sync::{MailMessage, SyncCursor, SyncPreference};
use crate::domains::watch::WatchSubscription;
use crate::kernel::jobs::{Job, QueueCounts, QueueName};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    // Users
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>>;

    // Sync cursors
    /// Missing cursors read as an empty idle cursor.
    async fn get_cursor(&self, user_id: Uuid) -> Result<SyncCursor>;
    /// Atomically flip the cursor from idle (or error) to syncing. Returns
    /// false when another sync already holds the syncing state.
    async fn try_begin_sync(&self, user_id: Uuid) -> Result<bool>;
    /// Persist the new cursor position and return to idle. Only called after
    /// the whole batch has been processed.
    async fn complete_sync(
        &self,
        user_id: Uuid,
        latest_cursor: &str,
        newly_synced: i64,
    ) -> Result<()>;
    /// Record the failure and return to the error state, leaving the cursor
    /// position untouched.
    async fn fail_sync(&self, user_id: Uuid, error: &str) -> Result<()>;

    // Messages
    /// Insert or update by `(user_id, provider_id)`, returning the row id.
    async fn upsert_message(&self, message: &MailMessage) -> Result<Uuid>;
    async fn get_message(&self, id: Uuid) -> Result<Option<MailMessage>>;
    async fn delete_message_by_provider_id(&self, user_id: Uuid, provider_id: &str) -> Result<()>;

    // Classifications
    async fn get_classification(&self, message_id: Uuid) -> Result<Option<ClassificationResult>>;
    async fn upsert_classification(&self, result: &ClassificationResult) -> Result<()>;

    // Watches
    async fn get_watch(&self, user_id: Uuid) -> Result<Option<WatchSubscription>>;
    async fn upsert_watch(&self, watch: &WatchSubscription) -> Result<()>;
    async fn mark_watch_inactive(&self, user_id: Uuid) -> Result<()>;
    /// Record a failed registration or renewal: inactive state, the error,
    /// and a bumped renewal counter. No-op when no watch row exists.
    async fn record_watch_failure(&self, user_id: Uuid, error: &str) -> Result<()>;
    async fn touch_watch_notification(&self, user_id: Uuid) -> Result<()>;
    async fn expiring_watches(&self, before: DateTime<Utc>) -> Result<Vec<WatchSubscription>>;

    // Sync preferences
    /// Missing rows read as the default preference.
    async fn get_preferences(&self, user_id: Uuid) -> Result<SyncPreference>;
    async fn auto_sync_users(&self) -> Result<Vec<SyncPreference>>;

    // Documents
    async fn insert_document(&self, document: &DocumentRecord) -> Result<()>;
    async fn get_document(&self, id: Uuid) -> Result<Option<DocumentRecord>>;
    async fn documents_for_message(&self, message_id: Uuid) -> Result<Vec<DocumentRecord>>;
    async fn set_document_processing(&self, id: Uuid) -> Result<()>;
    async fn set_document_done(&self, id: Uuid, text: &str) -> Result<()>;
    async fn set_document_error(&self, id: Uuid, error: &str) -> Result<()>;

    // Agent outputs
    /// Upsert by `(message_id, kind)`.
    async fn save_agent_output(&self, output: &AgentOutput) -> Result<()>;

    // Jobs
    async fn insert_job(&self, job: &Job) -> Result<()>;
    /// Find a waiting, delayed, or active job carrying this dedupe key.
    async fn find_active_job(&self, dedupe_key: &str) -> Result<Option<Job>>;
    /// Claim up to `limit` due jobs from a queue, marking them active. Due
    /// means waiting, or delayed with `run_at` in the past. Claims are
    /// exclusive across concurrent workers.
    async fn claim_jobs(&self, queue: QueueName, limit: i64) -> Result<Vec<Job>>;
    async fn mark_job_completed(&self, job_id: Uuid) -> Result<()>;
    /// Schedule a retry: bump the attempt counter, record the error, and
    /// park the job as delayed until `run_at`.
    async fn requeue_job(&self, job_id: Uuid, run_at: DateTime<Utc>, error: &str) -> Result<()>;
    async fn mark_job_failed(&self, job_id: Uuid, error: &str) -> Result<()>;
    async fn queue_counts(&self, queue: QueueName) -> Result<QueueCounts>;
}
