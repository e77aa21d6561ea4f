//! Trait seams for external providers.
//!
//! The engine consumes the mailbox, model, and extraction providers through
//! these narrow contracts so tests can substitute recording mocks (see
//! `test_dependencies`) and production wires concrete HTTP clients.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::common::ProviderError;

// =============================================================================
// Mailbox provider
// =============================================================================

/// Opaque reference to a message the provider reported as new.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub provider_id: String,
}

/// Changes reported by the mailbox since a cursor position.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub added: Vec<MessageRef>,
    /// Provider ids of messages removed from the mailbox.
    pub deleted: Vec<String>,
    /// Cursor to persist once the whole batch has been processed.
    pub latest_cursor: String,
}

#[derive(Debug, Clone)]
pub struct AttachmentRef {
    pub filename: String,
    pub mime_type: String,
    pub attachment_id: String,
}

/// Full message content as fetched from the provider.
#[derive(Debug, Clone, Default)]
pub struct FetchedMessage {
    pub provider_id: String,
    pub thread_id: Option<String>,
    pub subject: String,
    pub from_email: String,
    pub to_email: String,
    pub body: String,
    pub snippet: String,
    pub labels: Vec<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub attachments: Vec<AttachmentRef>,
}

#[derive(Debug, Clone)]
pub struct WatchRegistration {
    pub watch_id: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait MailboxProvider: Send + Sync {
    /// List message changes newer than `cursor`.
    async fn list_changes_since(
        &self,
        user_id: Uuid,
        cursor: &str,
    ) -> Result<ChangeBatch, ProviderError>;

    /// List recent messages up to `limit`, used for a full sync when no
    /// cursor exists yet. `latest_cursor` is the provider's current position.
    async fn list_recent(&self, user_id: Uuid, limit: usize)
        -> Result<ChangeBatch, ProviderError>;

    async fn fetch_message(
        &self,
        user_id: Uuid,
        provider_id: &str,
    ) -> Result<FetchedMessage, ProviderError>;

    async fn fetch_attachment(
        &self,
        user_id: Uuid,
        provider_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ProviderError>;

    /// Register a push watch delivering notifications to `topic`.
    async fn register_watch(
        &self,
        user_id: Uuid,
        topic: &str,
    ) -> Result<WatchRegistration, ProviderError>;

    async fn deregister_watch(&self, user_id: Uuid) -> Result<(), ProviderError>;
}

// =============================================================================
// Model provider
// =============================================================================

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Run a completion against a named model.
    ///
    /// An unavailable model must surface as [`ProviderError::ModelNotFound`]
    /// so the classification pipeline can retry against its fallback model.
    async fn complete(
        &self,
        prompt: &str,
        max_tokens: u32,
        model: &str,
    ) -> Result<String, ProviderError>;
}

// =============================================================================
// Extraction provider (OCR-style long-running operations)
// =============================================================================

/// Handle to a long-running provider-side operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationHandle {
    pub name: String,
    /// Where the provider will shard result fragments.
    pub output_location: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Processing,
    Done,
    Error(String),
}

#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    /// Upload source bytes, returning the provider-side source reference.
    async fn store_source(
        &self,
        path: &str,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<String, ProviderError>;

    /// Start a batch text-extraction operation over a stored source.
    async fn submit_batch(&self, source_ref: &str) -> Result<OperationHandle, ProviderError>;

    async fn poll(&self, handle: &OperationHandle) -> Result<OperationStatus, ProviderError>;

    /// Fetch all output fragments under a location, in listing order.
    async fn fetch_outputs(&self, output_location: &str) -> Result<Vec<String>, ProviderError>;

    /// Remove the source and output artifacts once text has been retrieved.
    async fn delete_artifacts(
        &self,
        source_ref: &str,
        output_location: &str,
    ) -> Result<(), ProviderError>;
}

// =============================================================================
// Token source
// =============================================================================

/// Supplies per-user access tokens for the mailbox provider. Credential
/// issuance and refresh live outside the engine.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self, user_id: Uuid) -> Result<String, ProviderError>;
}

/// Fixed-token source for single-user or development deployments.
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self, _user_id: Uuid) -> Result<String, ProviderError> {
        Ok(self.token.clone())
    }
}
