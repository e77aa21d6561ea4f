//! Classification pipeline: pattern stage first, model stage only when the
//! patterns yield no decision.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::common::ProviderError;
use crate::kernel::retry::RetryPolicy;
use crate::kernel::traits::ModelProvider;
use crate::store::RecordStore;

use super::models::{Category, ClassificationResult, Priority, Sentiment};
use super::patterns::pre_classify;

/// Pattern matches are treated as certain.
pub const PATTERN_CONFIDENCE: f32 = 0.85;

/// Character budget for the body excerpt included in the model prompt.
pub const PROMPT_BODY_BUDGET: usize = 2000;

const MODEL_MAX_TOKENS: u32 = 1024;

pub struct ClassificationPipeline {
    store: Arc<dyn RecordStore>,
    model: Arc<dyn ModelProvider>,
    retry: RetryPolicy,
    primary_model: String,
    fallback_model: String,
}

/// Structured response requested from the model.
#[derive(Debug, Deserialize)]
struct ModelClassification {
    category: Category,
    priority: Priority,
    sentiment: Sentiment,
    #[serde(default)]
    tags: Vec<String>,
    confidence_score: f32,
}

impl ClassificationPipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        model: Arc<dyn ModelProvider>,
        retry: RetryPolicy,
        primary_model: impl Into<String>,
        fallback_model: impl Into<String>,
    ) -> Self {
        Self {
            store,
            model,
            retry,
            primary_model: primary_model.into(),
            fallback_model: fallback_model.into(),
        }
    }

    /// Classify a persisted message and upsert the result keyed by its id.
    pub async fn classify_message(&self, message_id: Uuid) -> Result<ClassificationResult> {
        let message = self
            .store
            .get_message(message_id)
            .await?
            .ok_or_else(|| anyhow!("message not found: {message_id}"))?;

        let result = match pre_classify(&message.subject, &message.body) {
            Some(category) => {
                tracing::debug!(
                    message_id = %message_id,
                    category = category.slug(),
                    "pattern pre-classifier matched"
                );
                ClassificationResult {
                    message_id,
                    category,
                    priority: Priority::Medium,
                    sentiment: Sentiment::Neutral,
                    tags: vec![category.slug().to_string()],
                    confidence: PATTERN_CONFIDENCE,
                    classified_at: Utc::now(),
                }
            }
            None => {
                let prompt = build_prompt(&message.from_email, &message.subject, &message.body);
                let response = self.complete_with_fallback(&prompt).await?;
                let parsed = parse_model_response(&response)
                    .context("model returned an unparseable classification")?;
                ClassificationResult {
                    message_id,
                    category: parsed.category,
                    priority: parsed.priority,
                    sentiment: parsed.sentiment,
                    tags: parsed.tags,
                    confidence: parsed.confidence_score.clamp(0.0, 1.0),
                    classified_at: Utc::now(),
                }
            }
        };

        self.store.upsert_classification(&result).await?;

        tracing::info!(
            message_id = %message_id,
            category = result.category.slug(),
            confidence = result.confidence,
            "message classified"
        );

        Ok(result)
    }

    /// Call the primary model; on model-not-found retry exactly once against
    /// the fallback model.
    async fn complete_with_fallback(&self, prompt: &str) -> Result<String> {
        let primary = self
            .retry
            .execute(|| {
                self.model
                    .complete(prompt, MODEL_MAX_TOKENS, &self.primary_model)
            })
            .await;

        match primary {
            Ok(text) => Ok(text),
            Err(ProviderError::ModelNotFound { model }) => {
                tracing::warn!(
                    model = %model,
                    fallback = %self.fallback_model,
                    "primary model unavailable, retrying with fallback"
                );
                self.retry
                    .execute(|| {
                        self.model
                            .complete(prompt, MODEL_MAX_TOKENS, &self.fallback_model)
                    })
                    .await
                    .context("fallback model call failed")
            }
            Err(e) => Err(e).context("primary model call failed"),
        }
    }
}

fn build_prompt(from_email: &str, subject: &str, body: &str) -> String {
    let excerpt: String = body.chars().take(PROMPT_BODY_BUDGET).collect();
    format!(
        "You are an expert email classifier for an executive assistant. \
Analyze this email and classify it accurately.\n\n\
FROM: {from_email}\n\
SUBJECT: {subject}\n\
BODY: {excerpt}\n\n\
Categories: client_request, invoice, contract, project_update, general, other.\n\
Priority: urgent, high, medium, low.\n\
Sentiment: positive, neutral, negative, action_required.\n\n\
Respond ONLY with valid JSON (no markdown):\n\
{{\"category\": \"...\", \"priority\": \"...\", \"sentiment\": \"...\", \
\"tags\": [\"tag1\"], \"confidence_score\": 0.95}}"
    )
}

/// Extract the first JSON object from the model output.
fn parse_model_response(text: &str) -> Result<ModelClassification> {
    let start = text.find('{').ok_or_else(|| anyhow!("no JSON in response"))?;
    let end = text.rfind('}').ok_or_else(|| anyhow!("no JSON in response"))?;
    let parsed = serde_json::from_str(&text[start..=end])?;
    Ok(parsed)
}
