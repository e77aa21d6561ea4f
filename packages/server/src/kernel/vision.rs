//! Vision OCR-backed [`ExtractionProvider`].
//!
//! Sources and output shards live in a storage bucket; the annotate call is
//! a long-running operation polled by the extraction domain.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::common::ProviderError;
use crate::kernel::traits::{
    ExtractionProvider, OperationHandle, OperationStatus, TokenSource,
};

const VISION_URL: &str = "https://vision.googleapis.com/v1";
const STORAGE_URL: &str = "https://storage.googleapis.com/storage/v1";
const UPLOAD_URL: &str = "https://storage.googleapis.com/upload/storage/v1";
const OUTPUT_BATCH_SIZE: u32 = 20;

/// The token source is queried with this id for the service identity; user
/// ids are not meaningful for bucket and OCR access.
const SERVICE_PRINCIPAL: Uuid = Uuid::nil();

pub struct VisionExtraction {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    bucket: String,
}

#[derive(Debug, Deserialize)]
struct OperationResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct OperationPoll {
    #[serde(default)]
    done: bool,
    error: Option<OperationError>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ObjectListing {
    #[serde(default)]
    items: Vec<ObjectEntry>,
}

#[derive(Debug, Deserialize)]
struct ObjectEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateOutput {
    #[serde(default)]
    responses: Vec<AnnotateResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateResponse {
    full_text_annotation: Option<TextAnnotation>,
}

#[derive(Debug, Deserialize)]
struct TextAnnotation {
    text: String,
}

impl VisionExtraction {
    pub fn new(tokens: Arc<dyn TokenSource>, bucket: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            tokens,
            bucket: bucket.into(),
        }
    }

    async fn token(&self) -> Result<String, ProviderError> {
        self.tokens.access_token(SERVICE_PRINCIPAL).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ProviderError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(self.token().await?)
            .send()
            .await?;
        Self::parse(response).await?.json().await.map_err(Into::into)
    }

    async fn parse(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    fn object_prefix<'a>(&self, location: &'a str) -> &'a str {
        location
            .strip_prefix(&format!("gs://{}/", self.bucket))
            .unwrap_or(location)
    }
}

/// Object names only contain characters we wrote into them; the separator is
/// the one thing that must be escaped in an object URL.
fn encode_object_name(name: &str) -> String {
    name.replace('/', "%2F")
}

#[async_trait]
impl ExtractionProvider for VisionExtraction {
    async fn store_source(
        &self,
        path: &str,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<String, ProviderError> {
        let url = format!(
            "{UPLOAD_URL}/b/{}/o?uploadType=media&name={}",
            self.bucket,
            encode_object_name(path)
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(self.token().await?)
            .header("Content-Type", mime_type)
            .body(bytes.to_vec())
            .send()
            .await?;
        Self::parse(response).await?;
        Ok(format!("gs://{}/{path}", self.bucket))
    }

    async fn submit_batch(&self, source_ref: &str) -> Result<OperationHandle, ProviderError> {
        let output_location = format!("gs://{}/ocr-output/{}/", self.bucket, Uuid::new_v4());
        let body = json!({
            "requests": [{
                "inputConfig": {
                    "gcsSource": { "uri": source_ref },
                    "mimeType": "application/pdf"
                },
                "features": [{ "type": "DOCUMENT_TEXT_DETECTION" }],
                "outputConfig": {
                    "gcsDestination": { "uri": output_location },
                    "batchSize": OUTPUT_BATCH_SIZE
                }
            }]
        });
        let response = self
            .http
            .post(format!("{VISION_URL}/files:asyncBatchAnnotate"))
            .bearer_auth(self.token().await?)
            .json(&body)
            .send()
            .await?;
        let operation: OperationResponse = Self::parse(response).await?.json().await?;

        tracing::debug!(operation = %operation.name, source = source_ref, "batch extraction submitted");
        Ok(OperationHandle {
            name: operation.name,
            output_location,
        })
    }

    async fn poll(&self, handle: &OperationHandle) -> Result<OperationStatus, ProviderError> {
        let poll: OperationPoll = self
            .get_json(&format!("{VISION_URL}/{}", handle.name))
            .await?;
        Ok(match (poll.done, poll.error) {
            (_, Some(error)) => OperationStatus::Error(error.message),
            (true, None) => OperationStatus::Done,
            (false, None) => OperationStatus::Processing,
        })
    }

    async fn fetch_outputs(&self, output_location: &str) -> Result<Vec<String>, ProviderError> {
        let prefix = self.object_prefix(output_location);
        let listing: ObjectListing = self
            .get_json(&format!(
                "{STORAGE_URL}/b/{}/o?prefix={}",
                self.bucket,
                encode_object_name(prefix)
            ))
            .await?;

        // Listing comes back in lexicographic name order, which matches the
        // provider's shard numbering.
        let mut fragments = Vec::with_capacity(listing.items.len());
        for object in listing.items {
            let output: AnnotateOutput = self
                .get_json(&format!(
                    "{STORAGE_URL}/b/{}/o/{}?alt=media",
                    self.bucket,
                    encode_object_name(&object.name)
                ))
                .await?;
            let text: String = output
                .responses
                .into_iter()
                .filter_map(|r| r.full_text_annotation.map(|t| t.text))
                .collect();
            fragments.push(text);
        }
        Ok(fragments)
    }

    async fn delete_artifacts(
        &self,
        source_ref: &str,
        output_location: &str,
    ) -> Result<(), ProviderError> {
        let mut names = vec![self.object_prefix(source_ref).to_string()];
        let prefix = self.object_prefix(output_location);
        let listing: ObjectListing = self
            .get_json(&format!(
                "{STORAGE_URL}/b/{}/o?prefix={}",
                self.bucket,
                encode_object_name(prefix)
            ))
            .await?;
        names.extend(listing.items.into_iter().map(|o| o.name));

        for name in names {
            let response = self
                .http
                .delete(format!(
                    "{STORAGE_URL}/b/{}/o/{}",
                    self.bucket,
                    encode_object_name(&name)
                ))
                .bearer_auth(self.token().await?)
                .send()
                .await?;
            // A missing object is already gone.
            if response.status().as_u16() != 404 {
                Self::parse(response).await?;
            }
        }
        Ok(())
    }
}
