//! Post-classification agent tasks that run a model over a stored message
//! and persist the output.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::kernel::deps::EngineDeps;

const AGENT_BODY_BUDGET: usize = 4000;
const AGENT_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Summarizer,
    TaskExtractor,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Summarizer => "summarizer",
            AgentKind::TaskExtractor => "task_extractor",
        }
    }
}

/// Persisted agent result, one row per `(message_id, kind)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub id: Uuid,
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub kind: AgentKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Run one agent task over a stored message and persist its output.
pub async fn run_agent_task(
    deps: &EngineDeps,
    kind: AgentKind,
    message_id: Uuid,
    user_id: Uuid,
) -> Result<()> {
    let message = deps
        .store
        .get_message(message_id)
        .await?
        .ok_or_else(|| anyhow!("message not found: {message_id}"))?;

    let excerpt: String = message.body.chars().take(AGENT_BODY_BUDGET).collect();
    let prompt = match kind {
        AgentKind::Summarizer => {
            // Extracted attachment text, when present, feeds the summary too.
            let documents = deps.store.documents_for_message(message_id).await?;
            let attachment_text: String = documents
                .iter()
                .filter_map(|d| d.extracted_text.as_deref())
                .collect::<Vec<_>>()
                .join("\n");
            let attachment_excerpt: String =
                attachment_text.chars().take(AGENT_BODY_BUDGET).collect();
            format!(
                "Summarize this email in 2-3 sentences. Focus on what the sender \
wants and any deadlines.\n\nFROM: {}\nSUBJECT: {}\nBODY: {excerpt}\n\
ATTACHMENT TEXT: {attachment_excerpt}",
                message.from_email, message.subject
            )
        }
        AgentKind::TaskExtractor => format!(
            "Extract concrete action items from this email as a plain bullet \
list, one per line. If there are none, respond with \"none\".\n\n\
FROM: {}\nSUBJECT: {}\nBODY: {excerpt}",
            message.from_email, message.subject
        ),
    };

    let model = deps.settings.primary_model.clone();
    let content = deps
        .retry
        .execute(|| deps.model.complete(&prompt, AGENT_MAX_TOKENS, &model))
        .await?;

    deps.store
        .save_agent_output(&AgentOutput {
            id: Uuid::new_v4(),
            message_id,
            user_id,
            kind,
            content,
            created_at: Utc::now(),
        })
        .await?;

    tracing::info!(message_id = %message_id, kind = kind.as_str(), "agent task completed");
    Ok(())
}
