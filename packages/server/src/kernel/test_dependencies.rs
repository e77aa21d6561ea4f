//! Recording test doubles for the provider traits, plus a pre-wired engine
//! for unit and integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::common::ProviderError;
use crate::kernel::deps::{EngineDeps, EngineSettings};
use crate::kernel::jobs::{JobQueue, JobRegistry, QueueMode};
use crate::kernel::retry::RetryPolicy;
use crate::kernel::traits::{
    ChangeBatch, ExtractionProvider, FetchedMessage, MailboxProvider, ModelProvider,
    OperationHandle, OperationStatus, WatchRegistration,
};
use crate::store::MemoryStore;

// =============================================================================
// Mailbox
// =============================================================================

#[derive(Default)]
pub struct MockMailbox {
    changes: Mutex<Vec<ChangeBatch>>,
    recent: Mutex<Option<ChangeBatch>>,
    messages: Mutex<HashMap<String, FetchedMessage>>,
    attachments: Mutex<HashMap<String, Vec<u8>>>,
    fail_fetch: Mutex<HashSet<String>>,
    watch_expiry: Mutex<Option<DateTime<Utc>>>,
    fail_watch: AtomicBool,
    cursor_calls: Mutex<Vec<String>>,
    deregister_calls: AtomicUsize,
}

impl MockMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a change batch; consumed one per `list_changes_since` call.
    pub fn with_changes(self, batch: ChangeBatch) -> Self {
        self.changes.lock().unwrap().push(batch);
        self
    }

    pub fn with_recent(self, batch: ChangeBatch) -> Self {
        *self.recent.lock().unwrap() = Some(batch);
        self
    }

    pub fn with_message(self, message: FetchedMessage) -> Self {
        self.messages
            .lock()
            .unwrap()
            .insert(message.provider_id.clone(), message);
        self
    }

    pub fn with_attachment(self, attachment_id: &str, bytes: Vec<u8>) -> Self {
        self.attachments
            .lock()
            .unwrap()
            .insert(attachment_id.to_string(), bytes);
        self
    }

    pub fn failing_fetch(self, provider_id: &str) -> Self {
        self.fail_fetch
            .lock()
            .unwrap()
            .insert(provider_id.to_string());
        self
    }

    pub fn with_watch_expiry(self, expires_at: DateTime<Utc>) -> Self {
        *self.watch_expiry.lock().unwrap() = Some(expires_at);
        self
    }

    pub fn failing_watch_registration(self) -> Self {
        self.fail_watch.store(true, Ordering::SeqCst);
        self
    }

    /// Cursors passed to `list_changes_since`, in call order.
    pub fn cursor_calls(&self) -> Vec<String> {
        self.cursor_calls.lock().unwrap().clone()
    }

    pub fn deregister_calls(&self) -> usize {
        self.deregister_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailboxProvider for MockMailbox {
    async fn list_changes_since(
        &self,
        _user_id: Uuid,
        cursor: &str,
    ) -> Result<ChangeBatch, ProviderError> {
        self.cursor_calls.lock().unwrap().push(cursor.to_string());
        let mut changes = self.changes.lock().unwrap();
        if changes.is_empty() {
            return Ok(ChangeBatch {
                added: Vec::new(),
                deleted: Vec::new(),
                latest_cursor: cursor.to_string(),
            });
        }
        Ok(changes.remove(0))
    }

    async fn list_recent(
        &self,
        _user_id: Uuid,
        _limit: usize,
    ) -> Result<ChangeBatch, ProviderError> {
        Ok(self.recent.lock().unwrap().clone().unwrap_or(ChangeBatch {
            added: Vec::new(),
            deleted: Vec::new(),
            latest_cursor: "cursor-full".to_string(),
        }))
    }

    async fn fetch_message(
        &self,
        _user_id: Uuid,
        provider_id: &str,
    ) -> Result<FetchedMessage, ProviderError> {
        if self.fail_fetch.lock().unwrap().contains(provider_id) {
            return Err(ProviderError::Status {
                status: 403,
                message: format!("forbidden: {provider_id}"),
            });
        }
        Ok(self
            .messages
            .lock()
            .unwrap()
            .get(provider_id)
            .cloned()
            .unwrap_or_else(|| FetchedMessage {
                provider_id: provider_id.to_string(),
                subject: format!("subject {provider_id}"),
                from_email: "sender@example.com".to_string(),
                ..FetchedMessage::default()
            }))
    }

    async fn fetch_attachment(
        &self,
        _user_id: Uuid,
        _provider_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        self.attachments
            .lock()
            .unwrap()
            .get(attachment_id)
            .cloned()
            .ok_or_else(|| ProviderError::Status {
                status: 404,
                message: format!("attachment not found: {attachment_id}"),
            })
    }

    async fn register_watch(
        &self,
        _user_id: Uuid,
        _topic: &str,
    ) -> Result<WatchRegistration, ProviderError> {
        if self.fail_watch.load(Ordering::SeqCst) {
            return Err(ProviderError::Status {
                status: 403,
                message: "push scope not granted".to_string(),
            });
        }
        let expires_at = self
            .watch_expiry
            .lock()
            .unwrap()
            .unwrap_or_else(|| Utc::now() + chrono::Duration::days(7));
        Ok(WatchRegistration {
            watch_id: Uuid::new_v4().to_string(),
            expires_at,
        })
    }

    async fn deregister_watch(&self, _user_id: Uuid) -> Result<(), ProviderError> {
        self.deregister_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Model
// =============================================================================

const DEFAULT_MODEL_RESPONSE: &str = r#"{"category": "general", "priority": "medium",
"sentiment": "neutral", "tags": [], "confidence_score": 0.5}"#;

#[derive(Default)]
pub struct MockModelProvider {
    responses: Mutex<Vec<String>>,
    not_found: Mutex<HashSet<String>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl MockModelProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response; consumed one per successful call. An empty queue
    /// serves a neutral default classification.
    pub fn with_response(self, response: &str) -> Self {
        self.responses.lock().unwrap().push(response.to_string());
        self
    }

    /// Make calls against this model name fail as model-not-found.
    pub fn with_model_not_found(self, model: &str) -> Self {
        self.not_found.lock().unwrap().insert(model.to_string());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn models_called(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(model, _)| model.clone())
            .collect()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }
}

#[async_trait]
impl ModelProvider for MockModelProvider {
    async fn complete(
        &self,
        prompt: &str,
        _max_tokens: u32,
        model: &str,
    ) -> Result<String, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push((model.to_string(), prompt.to_string()));
        if self.not_found.lock().unwrap().contains(model) {
            return Err(ProviderError::ModelNotFound {
                model: model.to_string(),
            });
        }
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(DEFAULT_MODEL_RESPONSE.to_string())
        } else {
            Ok(responses.remove(0))
        }
    }
}

// =============================================================================
// Extraction
// =============================================================================

#[derive(Default)]
pub struct MockExtraction {
    processing_polls: Mutex<u32>,
    outputs: Mutex<Vec<String>>,
    operation_error: Mutex<Option<String>>,
    fail_cleanup: AtomicBool,
    poll_calls: AtomicUsize,
    stored: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
}

impl MockExtraction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `Processing` for the first `polls` poll calls.
    pub fn processing_for(self, polls: u32) -> Self {
        *self.processing_polls.lock().unwrap() = polls;
        self
    }

    pub fn with_outputs(self, outputs: Vec<String>) -> Self {
        *self.outputs.lock().unwrap() = outputs;
        self
    }

    /// Like `with_outputs`, for a mock already behind an `Arc`.
    pub fn set_outputs(&self, outputs: Vec<String>) {
        *self.outputs.lock().unwrap() = outputs;
    }

    pub fn with_operation_error(self, message: &str) -> Self {
        *self.operation_error.lock().unwrap() = Some(message.to_string());
        self
    }

    pub fn failing_cleanup(self) -> Self {
        self.fail_cleanup.store(true, Ordering::SeqCst);
        self
    }

    pub fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }

    pub fn stored_sources(&self) -> Vec<String> {
        self.stored.lock().unwrap().clone()
    }

    pub fn deleted_artifacts(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExtractionProvider for MockExtraction {
    async fn store_source(
        &self,
        path: &str,
        _bytes: &[u8],
        _mime_type: &str,
    ) -> Result<String, ProviderError> {
        let source_ref = format!("mock://{path}");
        self.stored.lock().unwrap().push(source_ref.clone());
        Ok(source_ref)
    }

    async fn submit_batch(&self, source_ref: &str) -> Result<OperationHandle, ProviderError> {
        Ok(OperationHandle {
            name: format!("operations/{source_ref}"),
            output_location: format!("outputs/{source_ref}"),
        })
    }

    async fn poll(&self, _handle: &OperationHandle) -> Result<OperationStatus, ProviderError> {
        let call = self.poll_calls.fetch_add(1, Ordering::SeqCst) as u32;
        if call < *self.processing_polls.lock().unwrap() {
            return Ok(OperationStatus::Processing);
        }
        if let Some(message) = self.operation_error.lock().unwrap().clone() {
            return Ok(OperationStatus::Error(message));
        }
        Ok(OperationStatus::Done)
    }

    async fn fetch_outputs(&self, _output_location: &str) -> Result<Vec<String>, ProviderError> {
        Ok(self.outputs.lock().unwrap().clone())
    }

    async fn delete_artifacts(
        &self,
        source_ref: &str,
        output_location: &str,
    ) -> Result<(), ProviderError> {
        if self.fail_cleanup.load(Ordering::SeqCst) {
            return Err(ProviderError::Status {
                status: 403,
                message: "delete denied".to_string(),
            });
        }
        let mut deleted = self.deleted.lock().unwrap();
        deleted.push(source_ref.to_string());
        deleted.push(output_location.to_string());
        Ok(())
    }
}

// =============================================================================
// Pre-wired engine
// =============================================================================

/// A full engine over the in-memory store with recording providers, retry
/// delays shrunk to keep tests fast.
pub struct TestEngine {
    pub deps: Arc<EngineDeps>,
    pub store: Arc<MemoryStore>,
    pub mailbox: Arc<MockMailbox>,
    pub model: Arc<MockModelProvider>,
    pub extraction: Arc<MockExtraction>,
}

impl TestEngine {
    pub fn new(mode: QueueMode) -> Self {
        Self::with_mailbox(mode, MockMailbox::new())
    }

    pub fn with_mailbox(mode: QueueMode, mailbox: MockMailbox) -> Self {
        let store = Arc::new(MemoryStore::new());
        let mailbox = Arc::new(mailbox);
        let model = Arc::new(MockModelProvider::new());
        let extraction = Arc::new(MockExtraction::new());
        let queue = Arc::new(JobQueue::new(store.clone(), mode));

        let deps = Arc::new(
            EngineDeps::builder()
                .store(store.clone())
                .mailbox(mailbox.clone())
                .model(model.clone())
                .extraction(extraction.clone())
                .queue(queue.clone())
                .retry(RetryPolicy::new(2, Duration::from_millis(1)))
                .settings(EngineSettings::default())
                .build(),
        );

        if mode == QueueMode::Inline {
            let registry = Arc::new(JobRegistry::standard());
            let inline_deps = deps.clone();
            queue.install_inline_executor(move |job| {
                let registry = registry.clone();
                let deps = inline_deps.clone();
                Box::pin(async move { registry.run(job, deps).await })
            });
        }

        Self {
            deps,
            store,
            mailbox,
            model,
            extraction,
        }
    }
}
