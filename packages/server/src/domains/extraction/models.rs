use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    #[default]
    Pending,
    Processing,
    Done,
    Error,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStatus::Pending => "pending",
            ExtractionStatus::Processing => "processing",
            ExtractionStatus::Done => "done",
            ExtractionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExtractionStatus::Pending),
            "processing" => Some(ExtractionStatus::Processing),
            "done" => Some(ExtractionStatus::Done),
            "error" => Some(ExtractionStatus::Error),
            _ => None,
        }
    }
}

/// An attachment staged for text extraction. `source_ref` points at the
/// uploaded bytes on the provider side.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct DocumentRecord {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub user_id: Uuid,
    pub message_id: Uuid,
    pub filename: String,
    pub mime_type: String,
    pub source_ref: String,
    #[builder(default)]
    pub status: ExtractionStatus,
    #[builder(default)]
    pub extracted_text: Option<String>,
    #[builder(default)]
    pub error_message: Option<String>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}
