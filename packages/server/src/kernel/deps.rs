//! Dependency container handed to job handlers and HTTP routes.

use std::sync::Arc;

use typed_builder::TypedBuilder;

use crate::domains::sync::FULL_SYNC_MESSAGE_LIMIT;
use crate::kernel::jobs::JobQueue;
use crate::kernel::retry::RetryPolicy;
use crate::kernel::traits::{ExtractionProvider, MailboxProvider, ModelProvider};
use crate::store::RecordStore;
use crate::Config;

/// Engine knobs resolved once at startup.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub primary_model: String,
    pub fallback_model: String,
    pub push_topic: String,
    pub full_sync_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            primary_model: "gpt-5".into(),
            fallback_model: "gpt-5-mini".into(),
            push_topic: "mail-notifications".into(),
            full_sync_limit: FULL_SYNC_MESSAGE_LIMIT,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            primary_model: config.primary_model.clone(),
            fallback_model: config.fallback_model.clone(),
            push_topic: config.push_topic.clone(),
            full_sync_limit: FULL_SYNC_MESSAGE_LIMIT,
        }
    }
}

/// Everything a handler needs, behind trait objects so tests can substitute
/// the in-memory store and recording providers.
#[derive(TypedBuilder)]
pub struct EngineDeps {
    pub store: Arc<dyn RecordStore>,
    pub mailbox: Arc<dyn MailboxProvider>,
    pub model: Arc<dyn ModelProvider>,
    pub extraction: Arc<dyn ExtractionProvider>,
    pub queue: Arc<JobQueue>,
    #[builder(default)]
    pub retry: RetryPolicy,
    #[builder(default)]
    pub settings: EngineSettings,
}
