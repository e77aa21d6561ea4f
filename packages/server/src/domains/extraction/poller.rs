use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use uuid::Uuid;

use crate::common::ProviderError;
use crate::kernel::retry::RetryPolicy;
use crate::kernel::traits::{ExtractionProvider, OperationHandle, OperationStatus};
use crate::store::RecordStore;

pub const POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const POLL_MAX_ATTEMPTS: u32 = 40;

/// Drives a provider-side batch extraction to completion: submit, poll until
/// done, collect output fragments, clean up.
pub struct ExtractionPoller {
    provider: Arc<dyn ExtractionProvider>,
    store: Arc<dyn RecordStore>,
    retry: RetryPolicy,
    poll_interval: Duration,
    max_polls: u32,
}

impl ExtractionPoller {
    pub fn new(
        provider: Arc<dyn ExtractionProvider>,
        store: Arc<dyn RecordStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            store,
            retry,
            poll_interval: POLL_INTERVAL,
            max_polls: POLL_MAX_ATTEMPTS,
        }
    }

    #[cfg(test)]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Extract text for a staged document and persist the outcome.
    ///
    /// Artifact cleanup after a successful fetch is best effort; leaked
    /// artifacts never fail a job that already has its text.
    pub async fn run(&self, document_id: Uuid) -> Result<()> {
        let document = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| anyhow!("document not found: {document_id}"))?;

        self.store.set_document_processing(document_id).await?;

        let handle = match self.submit(&document.source_ref).await {
            Ok(handle) => handle,
            Err(e) => {
                self.store
                    .set_document_error(document_id, &e.to_string())
                    .await?;
                return Err(e.into());
            }
        };

        match self.await_result(&handle).await {
            Ok(text) => {
                self.store.set_document_done(document_id, &text).await?;
                if let Err(e) = self
                    .provider
                    .delete_artifacts(&document.source_ref, &handle.output_location)
                    .await
                {
                    tracing::warn!(
                        document_id = %document_id,
                        error = %e,
                        "extraction artifact cleanup failed"
                    );
                }
                tracing::info!(
                    document_id = %document_id,
                    chars = text.len(),
                    "document text extracted"
                );
                Ok(())
            }
            Err(e) => {
                self.store
                    .set_document_error(document_id, &e.to_string())
                    .await?;
                Err(e.into())
            }
        }
    }

    async fn submit(&self, source_ref: &str) -> Result<OperationHandle, ProviderError> {
        self.retry
            .execute(|| self.provider.submit_batch(source_ref))
            .await
    }

    /// Poll the operation until it settles, then collect its output.
    ///
    /// Fragments are concatenated in the provider's listing order, which for
    /// page-sharded outputs follows the shard naming scheme.
    async fn await_result(&self, handle: &OperationHandle) -> Result<String, ProviderError> {
        for attempt in 0..self.max_polls {
            if attempt > 0 {
                tokio::time::sleep(self.poll_interval).await;
            }
            match self.retry.execute(|| self.provider.poll(handle)).await? {
                OperationStatus::Processing => continue,
                OperationStatus::Done => {
                    let fragments = self
                        .retry
                        .execute(|| self.provider.fetch_outputs(&handle.output_location))
                        .await?;
                    return Ok(fragments.concat());
                }
                OperationStatus::Error(message) => {
                    return Err(ProviderError::Other(message));
                }
            }
        }
        Err(ProviderError::Timeout {
            attempts: self.max_polls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::extraction::{DocumentRecord, ExtractionStatus};
    use crate::kernel::test_dependencies::MockExtraction;
    use crate::store::MemoryStore;

    fn poller(provider: Arc<MockExtraction>, store: Arc<MemoryStore>) -> ExtractionPoller {
        ExtractionPoller::new(provider, store, RetryPolicy::default())
            .with_poll_interval(Duration::from_millis(1))
    }

    async fn seed_document(store: &MemoryStore) -> Uuid {
        let doc = DocumentRecord::builder()
            .user_id(Uuid::new_v4())
            .message_id(Uuid::new_v4())
            .filename("contract.pdf")
            .mime_type("application/pdf")
            .source_ref("sources/contract.pdf")
            .build();
        let id = doc.id;
        store.insert_document(&doc).await.unwrap();
        id
    }

    #[tokio::test]
    async fn fragments_concatenate_in_listing_order() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(
            MockExtraction::new()
                .processing_for(2)
                .with_outputs(vec!["page one ".into(), "page two".into()]),
        );
        let id = seed_document(&store).await;

        poller(provider, store.clone()).run(id).await.unwrap();

        let doc = store.get_document(id).await.unwrap().unwrap();
        assert_eq!(doc.status, ExtractionStatus::Done);
        assert_eq!(doc.extracted_text.as_deref(), Some("page one page two"));
    }

    #[tokio::test]
    async fn operation_error_fails_the_document() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockExtraction::new().with_operation_error("corrupt pdf"));
        let id = seed_document(&store).await;

        let result = poller(provider, store.clone()).run(id).await;
        assert!(result.is_err());

        let doc = store.get_document(id).await.unwrap().unwrap();
        assert_eq!(doc.status, ExtractionStatus::Error);
        assert!(doc.error_message.unwrap().contains("corrupt pdf"));
    }

    #[tokio::test]
    async fn never_done_operation_times_out() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockExtraction::new().processing_for(u32::MAX));
        let id = seed_document(&store).await;

        let result = poller(provider.clone(), store.clone()).run(id).await;
        assert!(result.is_err());
        assert_eq!(provider.poll_calls(), POLL_MAX_ATTEMPTS as usize);

        let doc = store.get_document(id).await.unwrap().unwrap();
        assert_eq!(doc.status, ExtractionStatus::Error);
    }

    #[tokio::test]
    async fn cleanup_failure_does_not_fail_the_run() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(
            MockExtraction::new()
                .with_outputs(vec!["text".into()])
                .failing_cleanup(),
        );
        let id = seed_document(&store).await;

        poller(provider, store.clone()).run(id).await.unwrap();

        let doc = store.get_document(id).await.unwrap().unwrap();
        assert_eq!(doc.status, ExtractionStatus::Done);
    }
}
