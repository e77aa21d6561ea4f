//! OpenAI-backed [`ModelProvider`].

use async_trait::async_trait;
use rig::completion::Prompt;
use rig::providers::openai;

use crate::common::ProviderError;
use crate::kernel::traits::ModelProvider;

const PREAMBLE: &str = "You are a precise assistant for a mailbox processing system.";

#[derive(Clone)]
pub struct OpenAiModel {
    client: openai::Client,
}

impl OpenAiModel {
    pub fn new(api_key: &str) -> Self {
        Self {
            client: openai::Client::new(api_key),
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiModel {
    async fn complete(
        &self,
        prompt: &str,
        max_tokens: u32,
        model: &str,
    ) -> Result<String, ProviderError> {
        let agent = self
            .client
            .agent(model)
            .preamble(PREAMBLE)
            .max_tokens(max_tokens as u64)
            .build();

        tracing::debug!(model, prompt_length = prompt.len(), "calling completion API");

        let response = agent.prompt(prompt).await.map_err(|e| {
            let message = e.to_string();
            // The API reports unknown model ids as a not-found error; the
            // classification pipeline needs that case distinguishable.
            if message.contains("model_not_found")
                || message.contains("does not exist")
                || message.to_lowercase().contains("not found")
            {
                ProviderError::ModelNotFound {
                    model: model.to_string(),
                }
            } else if message.contains("429") {
                ProviderError::Status {
                    status: 429,
                    message,
                }
            } else {
                ProviderError::Other(message)
            }
        })?;

        tracing::debug!(model, response_length = response.len(), "completion received");
        Ok(response)
    }
}
