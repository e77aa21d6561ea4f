//! Job model: named queues, lifecycle states, and the typed payload that
//! routes each job to its handler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domains::agents::AgentKind;

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    Sync,
    Classification,
    AgentTasks,
    Extraction,
    DeadLetter,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        QueueName::Sync,
        QueueName::Classification,
        QueueName::AgentTasks,
        QueueName::Extraction,
        QueueName::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Sync => "sync",
            QueueName::Classification => "classification",
            QueueName::AgentTasks => "agent-tasks",
            QueueName::Extraction => "extraction",
            QueueName::DeadLetter => "dead-letter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync" => Some(QueueName::Sync),
            "classification" => Some(QueueName::Classification),
            "agent-tasks" => Some(QueueName::AgentTasks),
            "extraction" => Some(QueueName::Extraction),
            "dead-letter" => Some(QueueName::DeadLetter),
            _ => None,
        }
    }

    /// Worker pool width for this queue.
    pub fn concurrency(&self) -> usize {
        match self {
            QueueName::Sync => 5,
            QueueName::Classification => 10,
            QueueName::AgentTasks => 3,
            QueueName::Extraction => 2,
            QueueName::DeadLetter => 1,
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Delayed => "delayed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobStatus::Waiting),
            "active" => Some(JobStatus::Active),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "delayed" => Some(JobStatus::Delayed),
            _ => None,
        }
    }
}

/// Typed job payload. The variant decides the target queue and, where the
/// work is idempotent, the deduplication key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Sync {
        user_id: Uuid,
        full: bool,
    },
    Classification {
        message_id: Uuid,
        user_id: Uuid,
    },
    AgentTask {
        kind: AgentKind,
        message_id: Uuid,
        user_id: Uuid,
    },
    Extraction {
        document_id: Uuid,
        user_id: Uuid,
    },
    /// Terminal record of a job that exhausted its attempts. Carries the
    /// original payload verbatim for inspection and manual replay.
    DeadLetter {
        original_queue: QueueName,
        payload: serde_json::Value,
        attempts_made: i32,
        failed_reason: String,
    },
}

impl JobPayload {
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::Sync { .. } => QueueName::Sync,
            JobPayload::Classification { .. } => QueueName::Classification,
            JobPayload::AgentTask { .. } => QueueName::AgentTasks,
            JobPayload::Extraction { .. } => QueueName::Extraction,
            JobPayload::DeadLetter { .. } => QueueName::DeadLetter,
        }
    }

    /// Stable key for collapsing duplicate work. `None` means every enqueue
    /// is distinct.
    pub fn dedupe_key(&self) -> Option<String> {
        match self {
            JobPayload::Sync { user_id, .. } => Some(format!("sync:{user_id}")),
            JobPayload::Classification { message_id, .. } => {
                Some(format!("classify:{message_id}"))
            }
            JobPayload::AgentTask {
                kind, message_id, ..
            } => Some(format!("{}:{message_id}", kind.as_str())),
            JobPayload::Extraction { document_id, .. } => Some(format!("extract:{document_id}")),
            JobPayload::DeadLetter { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: QueueName,
    pub payload: JobPayload,
    pub status: JobStatus,
    /// 1-based; the attempt this job is on (or about to run).
    pub attempt: i32,
    pub max_attempts: i32,
    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,
    pub dedupe_key: Option<String>,
    pub error_message: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(payload: JobPayload) -> Self {
        let now = Utc::now();
        // Dead-letter records are not retried.
        let max_attempts = match payload.queue() {
            QueueName::DeadLetter => 1,
            _ => DEFAULT_MAX_ATTEMPTS,
        };
        Self {
            id: Uuid::new_v4(),
            queue: payload.queue(),
            dedupe_key: payload.dedupe_key(),
            payload,
            status: JobStatus::Waiting,
            attempt: 1,
            max_attempts,
            run_at: now,
            error_message: None,
            enqueued_at: now,
            updated_at: now,
        }
    }

    pub fn delayed_by(mut self, delay: chrono::Duration) -> Self {
        self.status = JobStatus::Delayed;
        self.run_at = Utc::now() + delay;
        self
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_routes_to_queue() {
        let payload = JobPayload::Sync {
            user_id: Uuid::new_v4(),
            full: false,
        };
        assert_eq!(payload.queue(), QueueName::Sync);
        assert_eq!(Job::new(payload).queue, QueueName::Sync);
    }

    #[test]
    fn sync_dedupe_key_ignores_full_flag() {
        let user_id = Uuid::new_v4();
        let incremental = JobPayload::Sync {
            user_id,
            full: false,
        };
        let full = JobPayload::Sync { user_id, full: true };
        assert_eq!(incremental.dedupe_key(), full.dedupe_key());
    }

    #[test]
    fn dead_letter_jobs_never_dedupe_and_never_retry() {
        let payload = JobPayload::DeadLetter {
            original_queue: QueueName::Sync,
            payload: serde_json::json!({}),
            attempts_made: 3,
            failed_reason: "boom".into(),
        };
        assert_eq!(payload.dedupe_key(), None);
        let job = Job::new(payload);
        assert_eq!(job.max_attempts, 1);
        assert!(!job.attempts_remaining());
    }

    #[test]
    fn payload_wire_format_is_tagged() {
        let payload = JobPayload::Classification {
            message_id: Uuid::nil(),
            user_id: Uuid::nil(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "classification");
    }

    #[test]
    fn queue_names_round_trip() {
        for queue in QueueName::ALL {
            assert_eq!(QueueName::parse(queue.as_str()), Some(queue));
        }
    }
}
