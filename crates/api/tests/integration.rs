//! Integration tests for API routes.
//!
//! Uses `tower::ServiceExt` to drive the Axum router without a real HTTP
//! server, backed by the in-memory broadcast store.
//!
//! ```bash
//! cargo test -p courier-api --test integration
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration, Utc};
use serde_json::{Value, json};
use tower::ServiceExt;

use courier_api::routes::create_router;
use courier_api::state::AppState;
use courier_common::config::BroadcastSettings;
use courier_common::gateway::{GatewayError, GatewayReceipt, MessageGateway};
use courier_engine::lease::LeaseCoordinator;
use courier_engine::manager::RunManager;
use courier_engine::memory::{MemoryStore, MemoryUser};
use courier_engine::processor::QueueProcessor;

// ============================================================
// Helpers
// ============================================================

struct AcceptAll;

#[async_trait]
impl MessageGateway for AcceptAll {
    async fn send(&self, _address: &str, _text: &str) -> Result<GatewayReceipt, GatewayError> {
        Ok(GatewayReceipt { message_id: 1 })
    }
}

async fn seeded_store(users: i64) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new(3));
    for id in 1..=users {
        store
            .add_user(MemoryUser {
                id,
                chat_id: Some(format!("{}", 100 + id)),
                username: Some(format!("user{}", id)),
                first_name: Some(format!("User {}", id)),
                role: "customer".into(),
                ..Default::default()
            })
            .await;
    }
    store
}

fn app(store: &Arc<MemoryStore>) -> Router {
    let manager = RunManager::new(store.clone(), &BroadcastSettings::default());
    create_router(AppState::new(manager))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn create_all(app: &Router) -> i64 {
    let (status, body) = send(
        app,
        "POST",
        "/api/broadcasts",
        Some(json!({"message": "Hello there", "target": "ALL"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_i64().unwrap()
}

// ============================================================
// Health
// ============================================================

#[tokio::test]
async fn test_health_check() {
    let store = seeded_store(0).await;
    let (status, body) = send(&app(&store), "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "courier-api");
}

// ============================================================
// Enqueue
// ============================================================

#[tokio::test]
async fn test_create_broadcast_returns_created_run() {
    let store = seeded_store(3).await;
    let app = app(&store);

    let (status, body) = send(
        &app,
        "POST",
        "/api/broadcasts",
        Some(json!({
            "message": "  Flash sale  ",
            "kind": "promo",
            "target": "ALL",
            "limit": 2,
            "requestedBy": 7
        })),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "QUEUED");
    assert_eq!(body["message"], "Flash sale");
    assert_eq!(body["kind"], "promo");
    assert_eq!(body["total_recipients"], 2);
    assert_eq!(body["requested_by"], 7);
    assert!(body.get("lock_token").is_none());
}

#[tokio::test]
async fn test_create_broadcast_validation_errors() {
    let store = seeded_store(0).await;
    let app = app(&store);

    for payload in [
        json!({"message": "   ", "target": "ALL"}),
        json!({"message": "hi", "target": "ROLE"}),
        json!({"message": "hi", "target": "USERS", "userIds": []}),
        json!({"message": "hi", "target": "ALL", "limit": 0}),
        json!({"message": "x".repeat(4001), "target": "ALL"}),
    ] {
        let (status, body) = send(&app, "POST", "/api/broadcasts", Some(payload)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }
}

#[tokio::test]
async fn test_zero_recipient_broadcast_is_completed() {
    let store = seeded_store(0).await;
    let (status, body) = send(
        &app(&store),
        "POST",
        "/api/broadcasts",
        Some(json!({"message": "anyone?", "target": "VIP"})),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "COMPLETED");
    assert_eq!(body["total_recipients"], 0);
}

// ============================================================
// Reads
// ============================================================

#[tokio::test]
async fn test_list_and_detail() {
    let store = seeded_store(2).await;
    let app = app(&store);
    let first = create_all(&app).await;
    let second = create_all(&app).await;

    let (status, body) = send(&app, "GET", "/api/broadcasts?page=1&page_size=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["page_size"], 1);
    assert_eq!(body["items"][0]["id"], second);

    let (status, body) = send(&app, "GET", &format!("/api/broadcasts/{}", first), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["run"]["id"], first);
    assert_eq!(body["counts"]["pending"], 2);

    let (status, _) = send(&app, "GET", "/api/broadcasts/999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delivery_listing_with_filters() {
    let store = seeded_store(3).await;
    let app = app(&store);
    let run_id = create_all(&app).await;

    let processor = QueueProcessor::new(
        store.clone(),
        Arc::new(AcceptAll),
        store.clone(),
        &BroadcastSettings::default(),
    );
    processor.tick().await.unwrap();

    let uri = format!("/api/broadcasts/{}/deliveries?filter=SENT", run_id);
    let (status, body) = send(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    assert_eq!(body["items"][0]["status"], "SENT");
    assert_eq!(body["items"][0]["recipient_name"], "User 1");
    assert_eq!(body["items"][0]["recipient_username"], "user1");

    let uri = format!("/api/broadcasts/{}/deliveries?filter=NOT_SENT", run_id);
    let (_, body) = send(&app, "GET", &uri, None).await;
    assert_eq!(body["total"], 0);

    let uri = format!("/api/broadcasts/{}/deliveries?filter=EVERYTHING", run_id);
    let (status, _) = send(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================================================
// Admin transitions
// ============================================================

#[tokio::test]
async fn test_cancel_then_delete() {
    let store = seeded_store(2).await;
    let app = app(&store);
    let run_id = create_all(&app).await;

    let uri = format!("/api/broadcasts/{}", run_id);
    let (status, _) = send(&app, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(&app, "POST", &format!("{}/cancel", uri), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "CANCELLED");
    assert_eq!(body["failed_count"], 2);

    let (status, body) = send(&app, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);

    let (status, _) = send(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_repost_creates_new_run() {
    let store = seeded_store(2).await;
    let app = app(&store);
    let run_id = create_all(&app).await;

    let uri = format!("/api/broadcasts/{}/repost", run_id);
    let (status, body) = send(&app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_ne!(body["id"], run_id);
    assert_eq!(body["message"], "Hello there");
    assert_eq!(body["total_recipients"], 2);
}

#[tokio::test]
async fn test_requeue_unknown_conflicts_while_running() {
    let store = seeded_store(2).await;
    let app = app(&store);
    let run_id = create_all(&app).await;

    let leases = LeaseCoordinator::new(store.clone(), Duration::seconds(120), Duration::seconds(60));
    let lease = leases.claim_next_run(Utc::now(), &[]).await.unwrap().unwrap();
    assert_eq!(lease.run_id, run_id);

    let uri = format!("/api/broadcasts/{}/requeue-unknown", run_id);
    let (status, _) = send(&app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Once cancelled, in-flight rows are UNKNOWN and can be requeued.
    leases.claim_batch(run_id, 1, Utc::now()).await.unwrap();
    send(&app, "POST", &format!("/api/broadcasts/{}/cancel", run_id), None).await;

    let (status, body) = send(&app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["requeued"], 1);

    let (_, run) = send(&app, "GET", &format!("/api/broadcasts/{}", run_id), None).await;
    assert_eq!(run["run"]["status"], "QUEUED");
}
