//! Sync state models: the per-user cursor, sync preferences, and the
//! persisted message record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    /// Doubles as the per-user in-flight lock: a sync worker must win the
    /// idle->syncing compare-and-set before touching the mailbox.
    Syncing,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(SyncStatus::Idle),
            "syncing" => Some(SyncStatus::Syncing),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

/// Per-user opaque sync position.
///
/// `history_id` only advances on successful completion of a whole sync batch;
/// a failed batch leaves it untouched so redelivery resumes from the same
/// point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCursor {
    pub user_id: Uuid,
    pub history_id: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub error_message: Option<String>,
    pub total_synced: i64,
}

impl SyncCursor {
    pub fn empty(user_id: Uuid) -> Self {
        Self {
            user_id,
            history_id: None,
            last_sync_at: None,
            status: SyncStatus::Idle,
            error_message: None,
            total_synced: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    Webhook,
    Polling,
    #[default]
    Hybrid,
}

impl SyncStrategy {
    pub fn uses_polling(&self) -> bool {
        matches!(self, SyncStrategy::Polling | SyncStrategy::Hybrid)
    }

    pub fn uses_webhook(&self) -> bool {
        matches!(self, SyncStrategy::Webhook | SyncStrategy::Hybrid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStrategy::Webhook => "webhook",
            SyncStrategy::Polling => "polling",
            SyncStrategy::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "webhook" => Some(SyncStrategy::Webhook),
            "polling" => Some(SyncStrategy::Polling),
            "hybrid" => Some(SyncStrategy::Hybrid),
            _ => None,
        }
    }
}

/// Per-user sync configuration. Read-only input to the scheduler and
/// dispatcher; mutated only by the configuration surface outside this engine.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct SyncPreference {
    pub user_id: Uuid,
    #[builder(default)]
    pub strategy: SyncStrategy,
    #[builder(default = 15)]
    pub polling_interval_minutes: i64,
    #[builder(default = true)]
    pub auto_sync_enabled: bool,
    #[builder(default = true)]
    pub webhook_enabled: bool,
}

/// A persisted mail message, keyed by `(user_id, provider_id)`.
///
/// Persistence is an upsert: replaying the same provider id never creates a
/// duplicate row.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct MailMessage {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider_id: String,
    #[builder(default)]
    pub thread_id: Option<String>,
    #[builder(default)]
    pub subject: String,
    #[builder(default)]
    pub from_email: String,
    #[builder(default)]
    pub to_email: String,
    #[builder(default)]
    pub body: String,
    #[builder(default)]
    pub snippet: String,
    #[builder(default = false)]
    pub has_attachments: bool,
    #[builder(default)]
    pub labels: Vec<String>,
    #[builder(default)]
    pub received_at: Option<DateTime<Utc>>,
}
