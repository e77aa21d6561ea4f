use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    ClientRequest,
    Invoice,
    Contract,
    ProjectUpdate,
    General,
    Other,
}

impl Category {
    /// Tag-friendly form, e.g. `project_update` -> `project-update`.
    pub fn slug(&self) -> &'static str {
        match self {
            Category::ClientRequest => "client-request",
            Category::Invoice => "invoice",
            Category::Contract => "contract",
            Category::ProjectUpdate => "project-update",
            Category::General => "general",
            Category::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    #[default]
    Neutral,
    Negative,
    ActionRequired,
}

/// Classification output, one row per message id. Re-classification
/// overwrites the existing row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub message_id: Uuid,
    pub category: Category,
    pub priority: Priority,
    pub sentiment: Sentiment,
    pub tags: Vec<String>,
    pub confidence: f32,
    pub classified_at: DateTime<Utc>,
}
