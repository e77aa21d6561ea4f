//! End-to-end engine flows in inline mode: the queue executes handlers
//! synchronously, so each assertion sees the fully settled state.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tower::ServiceExt;
use uuid::Uuid;

use mailroom_core::domains::classification::Category;
use mailroom_core::domains::extraction::ExtractionStatus;
use mailroom_core::domains::sync::{SyncDispatcher, SyncStatus};
use mailroom_core::kernel::jobs::{QueueMode, QueueName};
use mailroom_core::kernel::test_dependencies::{MockMailbox, TestEngine};
use mailroom_core::kernel::traits::{AttachmentRef, ChangeBatch, FetchedMessage, MessageRef};
use mailroom_core::scheduler::PollingScheduler;
use mailroom_core::server::{build_app, AppState, NotificationVerifier};

fn batch(ids: &[&str], cursor: &str) -> ChangeBatch {
    ChangeBatch {
        added: ids
            .iter()
            .map(|id| MessageRef {
                provider_id: id.to_string(),
            })
            .collect(),
        deleted: Vec::new(),
        latest_cursor: cursor.to_string(),
    }
}

#[tokio::test]
async fn inline_sync_classifies_every_new_message() {
    let mailbox = MockMailbox::new()
        .with_recent(batch(&["m-1", "m-2"], "h-5"))
        .with_message(FetchedMessage {
            provider_id: "m-1".to_string(),
            subject: "Invoice #77 payment due".to_string(),
            from_email: "billing@vendor.example".to_string(),
            ..FetchedMessage::default()
        })
        .with_message(FetchedMessage {
            provider_id: "m-2".to_string(),
            subject: "Lunch on Friday?".to_string(),
            from_email: "friend@example.com".to_string(),
            ..FetchedMessage::default()
        });
    let engine = TestEngine::with_mailbox(QueueMode::Inline, mailbox);
    let user_id = Uuid::new_v4();

    let receipt = SyncDispatcher::new(engine.deps.queue.clone())
        .dispatch(user_id, false)
        .await
        .unwrap();
    assert_eq!(receipt.mode, "inline");

    assert_eq!(engine.store.message_count(user_id), 2);
    let cursor = engine.deps.store.get_cursor(user_id).await.unwrap();
    assert_eq!(cursor.history_id.as_deref(), Some("h-5"));
    assert_eq!(cursor.status, SyncStatus::Idle);

    // m-1 hit the invoice pattern, m-2 went to the model.
    let invoice = engine
        .store
        .find_message_by_provider_id(user_id, "m-1")
        .unwrap();
    let classification = engine
        .deps
        .store
        .get_classification(invoice.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(classification.category, Category::Invoice);
    assert_eq!(engine.model.call_count(), 1);

    let sync_counts = engine.deps.queue.stats(QueueName::Sync).await.unwrap();
    assert_eq!(sync_counts.completed, 1);
    let classify_counts = engine
        .deps
        .queue
        .stats(QueueName::Classification)
        .await
        .unwrap();
    assert_eq!(classify_counts.completed, 2);
}

#[tokio::test]
async fn redelivered_notification_is_a_no_op() {
    let mailbox = MockMailbox::new().with_recent(batch(&["m-1"], "h-5"));
    let engine = TestEngine::with_mailbox(QueueMode::Inline, mailbox);
    let user_id = Uuid::new_v4();
    let dispatcher = SyncDispatcher::new(engine.deps.queue.clone());

    dispatcher.dispatch(user_id, false).await.unwrap();
    // Redelivery: the cursor now exists, so this resolves incrementally and
    // the mock reports no changes past it.
    dispatcher.dispatch(user_id, false).await.unwrap();

    assert_eq!(engine.store.message_count(user_id), 1);
    assert_eq!(engine.mailbox.cursor_calls(), vec!["h-5".to_string()]);
    assert_eq!(engine.store.classification_count(
        engine
            .store
            .find_message_by_provider_id(user_id, "m-1")
            .unwrap()
            .id
    ), 1);
}

#[tokio::test]
async fn attachment_flows_through_extraction_to_summary() {
    let mailbox = MockMailbox::new()
        .with_recent(batch(&["m-1"], "h-5"))
        .with_message(FetchedMessage {
            provider_id: "m-1".to_string(),
            subject: "Signed contract attached".to_string(),
            from_email: "legal@client.example".to_string(),
            attachments: vec![AttachmentRef {
                filename: "contract.pdf".to_string(),
                mime_type: "application/pdf".to_string(),
                attachment_id: "att-1".to_string(),
            }],
            ..FetchedMessage::default()
        })
        .with_attachment("att-1", b"%PDF-1.7".to_vec());
    let engine = TestEngine::with_mailbox(QueueMode::Inline, mailbox);
    engine
        .extraction
        .set_outputs(vec!["EXTRACTED CONTRACT TEXT".to_string()]);
    let user_id = Uuid::new_v4();

    SyncDispatcher::new(engine.deps.queue.clone())
        .dispatch(user_id, false)
        .await
        .unwrap();

    let message = engine
        .store
        .find_message_by_provider_id(user_id, "m-1")
        .unwrap();
    let documents = engine
        .deps
        .store
        .documents_for_message(message.id)
        .await
        .unwrap();
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].status, ExtractionStatus::Done);
    assert_eq!(
        documents[0].extracted_text.as_deref(),
        Some("EXTRACTED CONTRACT TEXT")
    );

    // Extraction success fed the summarizer.
    let summary = engine.store.agent_output(message.id, "summarizer").unwrap();
    assert!(!summary.content.is_empty());
    // The summarizer prompt carried the extracted text.
    assert!(engine
        .model
        .prompts()
        .iter()
        .any(|p| p.contains("EXTRACTED CONTRACT TEXT")));
}

#[tokio::test]
async fn failed_batch_never_advances_the_cursor() {
    let mailbox = MockMailbox::new()
        .with_recent(batch(&["m-1", "m-2"], "h-9"))
        .failing_fetch("m-2");
    let engine = TestEngine::with_mailbox(QueueMode::Inline, mailbox);
    let user_id = Uuid::new_v4();

    // Inline failures are recorded on the job, not raised to the caller.
    let receipt = SyncDispatcher::new(engine.deps.queue.clone())
        .dispatch(user_id, false)
        .await
        .unwrap();
    assert!(!receipt.duplicate);

    let cursor = engine.deps.store.get_cursor(user_id).await.unwrap();
    assert_eq!(cursor.history_id, None);
    assert_eq!(cursor.status, SyncStatus::Error);

    let counts = engine.deps.queue.stats(QueueName::Sync).await.unwrap();
    assert_eq!(counts.failed, 1);
}

// -- HTTP surface -------------------------------------------------------------

fn app(engine: &TestEngine) -> axum::Router {
    build_app(AppState {
        deps: engine.deps.clone(),
        scheduler: Arc::new(PollingScheduler::new(
            engine.deps.clone(),
            Duration::from_secs(3600),
        )),
        verifier: Arc::new(NotificationVerifier::disabled_for_development()),
        db_pool: None,
    })
}

fn push_request(email: &str) -> Request<Body> {
    let data = STANDARD.encode(
        serde_json::json!({ "emailAddress": email, "historyId": "12345" }).to_string(),
    );
    Request::builder()
        .method("POST")
        .uri("/webhooks/mail")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "message": { "data": data } }).to_string(),
        ))
        .unwrap()
}

#[tokio::test]
async fn webhook_dispatches_sync_for_known_mailbox() {
    let mailbox = MockMailbox::new().with_recent(batch(&["m-1"], "h-2"));
    let engine = TestEngine::with_mailbox(QueueMode::Inline, mailbox);
    let user = engine.store.insert_user("owner@example.com");

    let response = app(&engine)
        .oneshot(push_request("owner@example.com"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(engine.store.message_count(user.id), 1);
}

#[tokio::test]
async fn webhook_rejects_unknown_mailbox() {
    let engine = TestEngine::new(QueueMode::Inline);

    let response = app(&engine)
        .oneshot(push_request("stranger@example.com"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn webhook_rejects_undecodable_payload() {
    let engine = TestEngine::new(QueueMode::Inline);

    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/mail")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "message": { "data": "not-base64!!!" } }).to_string(),
        ))
        .unwrap();
    let response = app(&engine).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn queue_stats_route_serves_known_queues() {
    let engine = TestEngine::new(QueueMode::Inline);

    let ok = app(&engine)
        .oneshot(
            Request::builder()
                .uri("/queues/classification/stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);

    let missing = app(&engine)
        .oneshot(
            Request::builder()
                .uri("/queues/no-such-queue/stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn manual_trigger_sweeps_due_users() {
    let mailbox = MockMailbox::new().with_recent(batch(&["m-1"], "h-2"));
    let engine = TestEngine::with_mailbox(QueueMode::Inline, mailbox);
    let user = engine.store.insert_user("owner@example.com");
    engine.store.set_preferences(
        mailroom_core::domains::sync::SyncPreference::builder()
            .user_id(user.id)
            .build(),
    );

    let response = app(&engine)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/sync/trigger")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(engine.store.message_count(user.id), 1);
}

#[tokio::test]
async fn health_reports_ok_without_database() {
    let engine = TestEngine::new(QueueMode::Inline);

    let response = app(&engine)
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}
