use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub openai_api_key: String,
    /// Primary classification model; falls back to `fallback_model` when the
    /// provider reports the model as unavailable.
    pub primary_model: String,
    pub fallback_model: String,
    /// Expected OIDC audience on inbound push notifications. Verification
    /// fails closed when notifications are enabled and this is unset.
    pub notification_audience: Option<String>,
    /// Opt-out for local development only (`VERIFY_NOTIFICATIONS=false`).
    pub verify_notifications: bool,
    /// Pub/sub topic passed to the mailbox provider when registering a watch.
    pub push_topic: String,
    /// Polling scheduler tick, in seconds.
    pub poll_tick_secs: u64,
    /// "queue" (broker-backed workers) or "inline" (synchronous, no broker).
    pub queue_mode: QueueModeConfig,
    /// Remote bucket holding attachment sources and OCR output.
    pub extraction_bucket: String,
    /// Access token handed to the mailbox and storage clients. Single-tenant
    /// deployments set this directly; anything else plugs in a real token
    /// source at wiring time.
    pub mail_access_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueModeConfig {
    Queue,
    Inline,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let queue_mode = match env::var("QUEUE_MODE").as_deref() {
            Ok("inline") => QueueModeConfig::Inline,
            _ => QueueModeConfig::Queue,
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            openai_api_key: env::var("OPENAI_API_KEY").context("OPENAI_API_KEY must be set")?,
            primary_model: env::var("CLASSIFIER_MODEL").unwrap_or_else(|_| "gpt-5".to_string()),
            fallback_model: env::var("CLASSIFIER_FALLBACK_MODEL")
                .unwrap_or_else(|_| "gpt-5-mini".to_string()),
            notification_audience: env::var("NOTIFICATION_AUDIENCE").ok(),
            verify_notifications: env::var("VERIFY_NOTIFICATIONS")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(true),
            push_topic: env::var("PUSH_TOPIC").unwrap_or_else(|_| "mail-notifications".to_string()),
            poll_tick_secs: env::var("POLL_TICK_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .context("POLL_TICK_SECS must be a valid number")?,
            queue_mode,
            extraction_bucket: env::var("EXTRACTION_BUCKET")
                .unwrap_or_else(|_| "mailroom-attachments".to_string()),
            mail_access_token: env::var("MAIL_ACCESS_TOKEN").unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::QueueModeConfig;

    #[test]
    fn queue_mode_defaults_to_queue() {
        assert_ne!(QueueModeConfig::Queue, QueueModeConfig::Inline);
    }
}
