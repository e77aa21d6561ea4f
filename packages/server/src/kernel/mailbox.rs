//! Gmail-backed [`MailboxProvider`].
//!
//! Thin REST client over the history, messages, and watch endpoints. Per-user
//! OAuth tokens come from a [`TokenSource`]; credential refresh is outside
//! this crate.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::common::ProviderError;
use crate::kernel::traits::{
    AttachmentRef, ChangeBatch, FetchedMessage, MailboxProvider, MessageRef, TokenSource,
    WatchRegistration,
};

const BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const MAX_HISTORY_PAGES: usize = 10;

pub struct GmailMailbox {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    base_url: String,
}

// -- wire shapes --------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryListResponse {
    #[serde(default)]
    history: Vec<HistoryEntry>,
    history_id: Option<String>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryEntry {
    #[serde(default)]
    messages_added: Vec<MessageHolder>,
    #[serde(default)]
    messages_deleted: Vec<MessageHolder>,
}

#[derive(Debug, Deserialize)]
struct MessageHolder {
    message: MessageId,
}

#[derive(Debug, Deserialize)]
struct MessageId {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    history_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: Option<String>,
    snippet: Option<String>,
    #[serde(default)]
    label_ids: Vec<String>,
    internal_date: Option<String>,
    payload: Option<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    mime_type: Option<String>,
    filename: Option<String>,
    #[serde(default)]
    headers: Vec<Header>,
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartBody {
    data: Option<String>,
    attachment_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachmentResponse {
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchResponse {
    /// Millisecond epoch, as a string.
    expiration: String,
    history_id: Option<String>,
}

// -- client -------------------------------------------------------------------

impl GmailMailbox {
    pub fn new(tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            http: reqwest::Client::new(),
            tokens,
            base_url: BASE_URL.to_string(),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        user_id: Uuid,
        url: &str,
    ) -> Result<T, ProviderError> {
        let token = self.tokens.access_token(user_id).await?;
        let response = self.http.get(url).bearer_auth(token).send().await?;
        Self::parse(response).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        user_id: Uuid,
        url: &str,
        body: serde_json::Value,
    ) -> Result<T, ProviderError> {
        let token = self.tokens.access_token(user_id).await?;
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl MailboxProvider for GmailMailbox {
    async fn list_changes_since(
        &self,
        user_id: Uuid,
        cursor: &str,
    ) -> Result<ChangeBatch, ProviderError> {
        let mut added = Vec::new();
        let mut deleted = Vec::new();
        let mut latest_cursor = cursor.to_string();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_HISTORY_PAGES {
            let mut url = format!(
                "{}/history?startHistoryId={cursor}&historyTypes=messageAdded&historyTypes=messageDeleted",
                self.base_url
            );
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={token}"));
            }

            let page: HistoryListResponse = self.get_json(user_id, &url).await?;
            for entry in page.history {
                for holder in entry.messages_added {
                    added.push(MessageRef {
                        provider_id: holder.message.id,
                    });
                }
                for holder in entry.messages_deleted {
                    deleted.push(holder.message.id);
                }
            }
            if let Some(history_id) = page.history_id {
                latest_cursor = history_id;
            }
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        // Deleted-then-readded noise within one batch resolves as added.
        deleted.retain(|id| !added.iter().any(|a| &a.provider_id == id));

        Ok(ChangeBatch {
            added,
            deleted,
            latest_cursor,
        })
    }

    async fn list_recent(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<ChangeBatch, ProviderError> {
        let url = format!("{}/messages?maxResults={limit}", self.base_url);
        let listing: MessageListResponse = self.get_json(user_id, &url).await?;

        let profile_url = format!("{}/profile", self.base_url);
        let profile: ProfileResponse = self.get_json(user_id, &profile_url).await?;

        Ok(ChangeBatch {
            added: listing
                .messages
                .into_iter()
                .take(limit)
                .map(|m| MessageRef { provider_id: m.id })
                .collect(),
            deleted: Vec::new(),
            latest_cursor: profile.history_id,
        })
    }

    async fn fetch_message(
        &self,
        user_id: Uuid,
        provider_id: &str,
    ) -> Result<FetchedMessage, ProviderError> {
        let url = format!("{}/messages/{provider_id}?format=full", self.base_url);
        let message: GmailMessage = self.get_json(user_id, &url).await?;
        Ok(to_fetched(message))
    }

    async fn fetch_attachment(
        &self,
        user_id: Uuid,
        provider_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let url = format!(
            "{}/messages/{provider_id}/attachments/{attachment_id}",
            self.base_url
        );
        let attachment: AttachmentResponse = self.get_json(user_id, &url).await?;
        decode_base64(&attachment.data).ok_or_else(|| {
            ProviderError::Other(format!("undecodable attachment data: {attachment_id}"))
        })
    }

    async fn register_watch(
        &self,
        user_id: Uuid,
        topic: &str,
    ) -> Result<WatchRegistration, ProviderError> {
        let url = format!("{}/watch", self.base_url);
        let body = json!({
            "topicName": topic,
            "labelIds": ["INBOX"],
            "labelFilterBehavior": "INCLUDE",
        });
        let watch: WatchResponse = self.post_json(user_id, &url, body).await?;

        let expires_at = watch
            .expiration
            .parse::<i64>()
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| {
                ProviderError::Other(format!("bad watch expiration: {}", watch.expiration))
            })?;

        Ok(WatchRegistration {
            watch_id: watch.history_id.unwrap_or_default(),
            expires_at,
        })
    }

    async fn deregister_watch(&self, user_id: Uuid) -> Result<(), ProviderError> {
        let url = format!("{}/stop", self.base_url);
        let token = self.tokens.access_token(user_id).await?;
        let response = self.http.post(&url).bearer_auth(token).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

// -- payload parsing ----------------------------------------------------------

fn to_fetched(message: GmailMessage) -> FetchedMessage {
    let payload = message.payload.unwrap_or_default();
    let received_at = message
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

    FetchedMessage {
        provider_id: message.id,
        thread_id: message.thread_id,
        subject: header(&payload, "Subject"),
        from_email: header(&payload, "From"),
        to_email: header(&payload, "To"),
        body: extract_body(&payload),
        snippet: message.snippet.unwrap_or_default(),
        labels: message.label_ids,
        received_at,
        attachments: collect_attachments(&payload),
    }
}

fn header(payload: &Part, name: &str) -> String {
    payload
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
        .unwrap_or_default()
}

/// Prefer the first text/plain part anywhere in the tree, falling back to
/// text/html.
fn extract_body(payload: &Part) -> String {
    if let Some(text) = find_body(payload, "text/plain") {
        return text;
    }
    find_body(payload, "text/html").unwrap_or_default()
}

fn find_body(part: &Part, mime: &str) -> Option<String> {
    if part.mime_type.as_deref() == Some(mime) {
        if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) {
            if let Some(bytes) = decode_base64(data) {
                return Some(String::from_utf8_lossy(&bytes).into_owned());
            }
        }
    }
    part.parts.iter().find_map(|p| find_body(p, mime))
}

fn collect_attachments(payload: &Part) -> Vec<AttachmentRef> {
    let mut out = Vec::new();
    walk_attachments(payload, &mut out);
    out
}

fn walk_attachments(part: &Part, out: &mut Vec<AttachmentRef>) {
    let filename = part.filename.as_deref().unwrap_or_default();
    if !filename.is_empty() {
        if let Some(attachment_id) = part.body.as_ref().and_then(|b| b.attachment_id.clone()) {
            out.push(AttachmentRef {
                filename: filename.to_string(),
                mime_type: part
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                attachment_id,
            });
        }
    }
    for child in &part.parts {
        walk_attachments(child, out);
    }
}

/// Gmail serves URL-safe base64, sometimes without padding.
fn decode_base64(data: &str) -> Option<Vec<u8>> {
    URL_SAFE
        .decode(data)
        .or_else(|_| URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')))
        .ok()
}
