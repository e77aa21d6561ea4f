//! Postgres-backed [`RecordStore`].
//!
//! Job claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never hand
//! the same job to two handlers; the sync cursor compare-and-set rides on a
//! conditional upsert.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::domains::agents::AgentOutput;
use crate::domains::classification::ClassificationResult;
use crate::domains::extraction::{DocumentRecord, ExtractionStatus};
use crate::domains::sync::{MailMessage, SyncCursor, SyncPreference, SyncStatus, SyncStrategy};
use crate::domains::watch::{WatchState, WatchSubscription};
use crate::kernel::jobs::{Job, JobStatus, QueueCounts, QueueName};

use super::{RecordStore, UserRecord};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// -- row mapping --------------------------------------------------------------

fn cursor_from_row(row: &PgRow) -> Result<SyncCursor> {
    let status: String = row.try_get("status")?;
    Ok(SyncCursor {
        user_id: row.try_get("user_id")?,
        history_id: row.try_get("history_id")?,
        last_sync_at: row.try_get("last_sync_at")?,
        status: SyncStatus::parse(&status).ok_or_else(|| anyhow!("bad sync status: {status}"))?,
        error_message: row.try_get("error_message")?,
        total_synced: row.try_get("total_synced")?,
    })
}

fn message_from_row(row: &PgRow) -> Result<MailMessage> {
    let labels: serde_json::Value = row.try_get("labels")?;
    Ok(MailMessage {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        provider_id: row.try_get("provider_id")?,
        thread_id: row.try_get("thread_id")?,
        subject: row.try_get("subject")?,
        from_email: row.try_get("from_email")?,
        to_email: row.try_get("to_email")?,
        body: row.try_get("body")?,
        snippet: row.try_get("snippet")?,
        has_attachments: row.try_get("has_attachments")?,
        labels: serde_json::from_value(labels).context("bad labels column")?,
        received_at: row.try_get("received_at")?,
    })
}

fn classification_from_row(row: &PgRow) -> Result<ClassificationResult> {
    let category: String = row.try_get("category")?;
    let priority: String = row.try_get("priority")?;
    let sentiment: String = row.try_get("sentiment")?;
    let tags: serde_json::Value = row.try_get("tags")?;
    Ok(ClassificationResult {
        message_id: row.try_get("message_id")?,
        category: serde_json::from_value(serde_json::Value::String(category))
            .context("bad category column")?,
        priority: serde_json::from_value(serde_json::Value::String(priority))
            .context("bad priority column")?,
        sentiment: serde_json::from_value(serde_json::Value::String(sentiment))
            .context("bad sentiment column")?,
        tags: serde_json::from_value(tags).context("bad tags column")?,
        confidence: row.try_get("confidence")?,
        classified_at: row.try_get("classified_at")?,
    })
}

fn watch_from_row(row: &PgRow) -> Result<WatchSubscription> {
    let state: String = row.try_get("state")?;
    Ok(WatchSubscription {
        user_id: row.try_get("user_id")?,
        watch_id: row.try_get("watch_id")?,
        topic: row.try_get("topic")?,
        state: WatchState::parse(&state).ok_or_else(|| anyhow!("bad watch state: {state}"))?,
        expires_at: row.try_get("expires_at")?,
        last_notified_at: row.try_get("last_notified_at")?,
        last_error: row.try_get("last_error")?,
        renewal_attempts: row.try_get("renewal_attempts")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn preference_from_row(row: &PgRow) -> Result<SyncPreference> {
    let strategy: String = row.try_get("strategy")?;
    Ok(SyncPreference {
        user_id: row.try_get("user_id")?,
        strategy: SyncStrategy::parse(&strategy)
            .ok_or_else(|| anyhow!("bad sync strategy: {strategy}"))?,
        polling_interval_minutes: row.try_get("polling_interval_minutes")?,
        auto_sync_enabled: row.try_get("auto_sync_enabled")?,
        webhook_enabled: row.try_get("webhook_enabled")?,
    })
}

fn document_from_row(row: &PgRow) -> Result<DocumentRecord> {
    let status: String = row.try_get("status")?;
    Ok(DocumentRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        message_id: row.try_get("message_id")?,
        filename: row.try_get("filename")?,
        mime_type: row.try_get("mime_type")?,
        source_ref: row.try_get("source_ref")?,
        status: ExtractionStatus::parse(&status)
            .ok_or_else(|| anyhow!("bad extraction status: {status}"))?,
        extracted_text: row.try_get("extracted_text")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    let queue: String = row.try_get("queue")?;
    let status: String = row.try_get("status")?;
    let payload: serde_json::Value = row.try_get("payload")?;
    Ok(Job {
        id: row.try_get("id")?,
        queue: QueueName::parse(&queue).ok_or_else(|| anyhow!("bad queue name: {queue}"))?,
        payload: serde_json::from_value(payload).context("bad job payload")?,
        status: JobStatus::parse(&status).ok_or_else(|| anyhow!("bad job status: {status}"))?,
        attempt: row.try_get("attempt")?,
        max_attempts: row.try_get("max_attempts")?,
        run_at: row.try_get("run_at")?,
        dedupe_key: row.try_get("dedupe_key")?,
        error_message: row.try_get("error_message")?,
        enqueued_at: row.try_get("enqueued_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl RecordStore for PgStore {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query("SELECT id, email FROM users WHERE lower(email) = lower($1)")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(UserRecord {
                id: r.try_get("id")?,
                email: r.try_get("email")?,
            })
        })
        .transpose()
    }

    async fn get_cursor(&self, user_id: Uuid) -> Result<SyncCursor> {
        let row = sqlx::query("SELECT * FROM sync_cursors WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => cursor_from_row(&row),
            None => Ok(SyncCursor::empty(user_id)),
        }
    }

    async fn try_begin_sync(&self, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_cursors (user_id, status)
            VALUES ($1, 'syncing')
            ON CONFLICT (user_id) DO UPDATE
                SET status = 'syncing', updated_at = now()
                WHERE sync_cursors.status <> 'syncing'
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete_sync(
        &self,
        user_id: Uuid,
        latest_cursor: &str,
        newly_synced: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_cursors
            SET history_id = $2,
                last_sync_at = now(),
                status = 'idle',
                error_message = NULL,
                total_synced = total_synced + $3,
                updated_at = now()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(latest_cursor)
        .bind(newly_synced)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_sync(&self, user_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_cursors
            SET status = 'error', error_message = $2, updated_at = now()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_message(&self, message: &MailMessage) -> Result<Uuid> {
        let row = sqlx::query(
            r#"
            INSERT INTO mail_messages
                (id, user_id, provider_id, thread_id, subject, from_email, to_email,
                 body, snippet, has_attachments, labels, received_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (user_id, provider_id) DO UPDATE SET
                thread_id = EXCLUDED.thread_id,
                subject = EXCLUDED.subject,
                from_email = EXCLUDED.from_email,
                to_email = EXCLUDED.to_email,
                body = EXCLUDED.body,
                snippet = EXCLUDED.snippet,
                has_attachments = EXCLUDED.has_attachments,
                labels = EXCLUDED.labels,
                received_at = EXCLUDED.received_at,
                updated_at = now()
            RETURNING id
            "#,
        )
        .bind(message.id)
        .bind(message.user_id)
        .bind(&message.provider_id)
        .bind(&message.thread_id)
        .bind(&message.subject)
        .bind(&message.from_email)
        .bind(&message.to_email)
        .bind(&message.body)
        .bind(&message.snippet)
        .bind(message.has_attachments)
        .bind(serde_json::to_value(&message.labels)?)
        .bind(message.received_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<MailMessage>> {
        let row = sqlx::query("SELECT * FROM mail_messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| message_from_row(&r)).transpose()
    }

    async fn delete_message_by_provider_id(&self, user_id: Uuid, provider_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM mail_messages WHERE user_id = $1 AND provider_id = $2")
            .bind(user_id)
            .bind(provider_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_classification(&self, message_id: Uuid) -> Result<Option<ClassificationResult>> {
        let row = sqlx::query("SELECT * FROM classifications WHERE message_id = $1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| classification_from_row(&r)).transpose()
    }

    async fn upsert_classification(&self, result: &ClassificationResult) -> Result<()> {
        let category = serde_json::to_value(result.category)?;
        let priority = serde_json::to_value(result.priority)?;
        let sentiment = serde_json::to_value(result.sentiment)?;
        sqlx::query(
            r#"
            INSERT INTO classifications
                (message_id, category, priority, sentiment, tags, confidence, classified_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (message_id) DO UPDATE SET
                category = EXCLUDED.category,
                priority = EXCLUDED.priority,
                sentiment = EXCLUDED.sentiment,
                tags = EXCLUDED.tags,
                confidence = EXCLUDED.confidence,
                classified_at = EXCLUDED.classified_at
            "#,
        )
        .bind(result.message_id)
        .bind(category.as_str().unwrap_or_default())
        .bind(priority.as_str().unwrap_or_default())
        .bind(sentiment.as_str().unwrap_or_default())
        .bind(serde_json::to_value(&result.tags)?)
        .bind(result.confidence)
        .bind(result.classified_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_watch(&self, user_id: Uuid) -> Result<Option<WatchSubscription>> {
        let row = sqlx::query("SELECT * FROM watch_subscriptions WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| watch_from_row(&r)).transpose()
    }

    async fn upsert_watch(&self, watch: &WatchSubscription) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watch_subscriptions
                (user_id, watch_id, topic, state, expires_at, last_notified_at,
                 last_error, renewal_attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (user_id) DO UPDATE SET
                watch_id = EXCLUDED.watch_id,
                topic = EXCLUDED.topic,
                state = EXCLUDED.state,
                expires_at = EXCLUDED.expires_at,
                last_notified_at = EXCLUDED.last_notified_at,
                last_error = EXCLUDED.last_error,
                renewal_attempts = EXCLUDED.renewal_attempts,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(watch.user_id)
        .bind(&watch.watch_id)
        .bind(&watch.topic)
        .bind(watch.state.as_str())
        .bind(watch.expires_at)
        .bind(watch.last_notified_at)
        .bind(&watch.last_error)
        .bind(watch.renewal_attempts)
        .bind(watch.created_at)
        .bind(watch.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_watch_inactive(&self, user_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE watch_subscriptions SET state = 'inactive', updated_at = now() WHERE user_id = $1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_watch_failure(&self, user_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE watch_subscriptions
            SET state = 'inactive',
                last_error = $2,
                renewal_attempts = renewal_attempts + 1,
                updated_at = now()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_watch_notification(&self, user_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE watch_subscriptions SET last_notified_at = now() WHERE user_id = $1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn expiring_watches(&self, before: DateTime<Utc>) -> Result<Vec<WatchSubscription>> {
        let rows = sqlx::query(
            "SELECT * FROM watch_subscriptions WHERE state = 'active' AND expires_at <= $1",
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(watch_from_row).collect()
    }

    async fn get_preferences(&self, user_id: Uuid) -> Result<SyncPreference> {
        let row = sqlx::query("SELECT * FROM sync_preferences WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => preference_from_row(&row),
            None => Ok(SyncPreference::builder().user_id(user_id).build()),
        }
    }

    async fn auto_sync_users(&self) -> Result<Vec<SyncPreference>> {
        let rows = sqlx::query("SELECT * FROM sync_preferences WHERE auto_sync_enabled")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(preference_from_row).collect()
    }

    async fn insert_document(&self, document: &DocumentRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents
                (id, user_id, message_id, filename, mime_type, source_ref, status,
                 extracted_text, error_message, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(document.id)
        .bind(document.user_id)
        .bind(document.message_id)
        .bind(&document.filename)
        .bind(&document.mime_type)
        .bind(&document.source_ref)
        .bind(document.status.as_str())
        .bind(&document.extracted_text)
        .bind(&document.error_message)
        .bind(document.created_at)
        .bind(document.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<DocumentRecord>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| document_from_row(&r)).transpose()
    }

    async fn documents_for_message(&self, message_id: Uuid) -> Result<Vec<DocumentRecord>> {
        let rows = sqlx::query("SELECT * FROM documents WHERE message_id = $1 ORDER BY created_at")
            .bind(message_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn set_document_processing(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE documents SET status = 'processing', updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_document_done(&self, id: Uuid, text: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE documents
            SET status = 'done', extracted_text = $2, error_message = NULL, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_document_error(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE documents
            SET status = 'error', error_message = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_agent_output(&self, output: &AgentOutput) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agent_outputs (id, message_id, user_id, kind, content, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (message_id, kind) DO UPDATE SET
                content = EXCLUDED.content,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(output.id)
        .bind(output.message_id)
        .bind(output.user_id)
        .bind(output.kind.as_str())
        .bind(&output.content)
        .bind(output.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs
                (id, queue, payload, status, attempt, max_attempts, run_at,
                 dedupe_key, error_message, enqueued_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(job.id)
        .bind(job.queue.as_str())
        .bind(serde_json::to_value(&job.payload)?)
        .bind(job.status.as_str())
        .bind(job.attempt)
        .bind(job.max_attempts)
        .bind(job.run_at)
        .bind(&job.dedupe_key)
        .bind(&job.error_message)
        .bind(job.enqueued_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_active_job(&self, dedupe_key: &str) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE dedupe_key = $1 AND status IN ('waiting', 'active', 'delayed')
            ORDER BY enqueued_at
            LIMIT 1
            "#,
        )
        .bind(dedupe_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn claim_jobs(&self, queue: QueueName, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id FROM jobs
                WHERE queue = $1
                  AND (status = 'waiting' OR (status = 'delayed' AND run_at <= now()))
                ORDER BY enqueued_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'active', updated_at = now()
            WHERE id IN (SELECT id FROM claimable)
            RETURNING *
            "#,
        )
        .bind(queue.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn mark_job_completed(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = 'completed', updated_at = now() WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn requeue_job(&self, job_id: Uuid, run_at: DateTime<Utc>, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'delayed',
                attempt = attempt + 1,
                run_at = $2,
                error_message = $3,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(run_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_job_failed(&self, job_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'failed', error_message = $2, updated_at = now() WHERE id = $1",
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn queue_counts(&self, queue: QueueName) -> Result<QueueCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs WHERE queue = $1 GROUP BY status")
            .bind(queue.as_str())
            .fetch_all(&self.pool)
            .await?;
        let mut counts = QueueCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match JobStatus::parse(&status) {
                Some(JobStatus::Waiting) => counts.waiting = n,
                Some(JobStatus::Active) => counts.active = n,
                Some(JobStatus::Completed) => counts.completed = n,
                Some(JobStatus::Failed) => counts.failed = n,
                Some(JobStatus::Delayed) => counts.delayed = n,
                None => return Err(anyhow!("bad job status: {status}")),
            }
        }
        Ok(counts)
    }
}
