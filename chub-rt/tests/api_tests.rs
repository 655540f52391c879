//! Integration tests for the chub-rt HTTP and SSE surface
//!
//! Drives the full router with `oneshot` over in-memory storage, plus one
//! pass over SQLite to check the backends are interchangeable.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use chub_common::config::DeliveryConfig;
use chub_common::db::models::{User, UserRole};
use chub_rt::api::USER_ID_HEADER;
use chub_rt::channels::ChannelSet;
use chub_rt::storage::{MemoryStorage, SqliteStorage, Storage};
use chub_rt::{build_router, AppState};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt; // for `oneshot`
use uuid::Uuid;

struct TestApp {
    router: Router,
    admin: User,
    ada: User,
    bob: User,
}

async fn user(storage: &dyn Storage, name: &str, role: UserRole) -> User {
    let user = User {
        id: Uuid::new_v4(),
        username: name.to_string(),
        role,
        email: None,
        phone: None,
        created_at: Utc::now(),
    };
    storage.upsert_user(&user).await.unwrap();
    user
}

async fn setup_with(storage: Arc<dyn Storage>) -> TestApp {
    let admin = user(storage.as_ref(), "manager", UserRole::Admin).await;
    let ada = user(storage.as_ref(), "ada", UserRole::Client).await;
    let bob = user(storage.as_ref(), "bob", UserRole::Client).await;

    let config = DeliveryConfig {
        async_side_channels: false,
        ..DeliveryConfig::default()
    };
    let state = AppState::new(storage, ChannelSet::default(), &config);
    TestApp {
        router: build_router(state),
        admin,
        ada,
        bob,
    }
}

async fn setup() -> TestApp {
    setup_with(Arc::new(MemoryStorage::with_default_templates())).await
}

fn request(method: &str, uri: &str, as_user: Option<&User>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = as_user {
        builder = builder.header(USER_ID_HEADER, user.id.to_string());
    }
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &TestApp, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.router.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

async fn create_conversation(app: &TestApp, creator: &User, other: &User) -> String {
    let (status, body) = send(
        app,
        request(
            "POST",
            "/api/conversations",
            Some(creator),
            Some(json!({ "title": "Shoot", "participant_ids": [other.id] })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health_needs_no_identity() {
    let app = setup().await;
    let (status, body) = send(&app, request("GET", "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "chub-rt");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_identity_required() {
    let app = setup().await;

    let (status, body) = send(&app, request("GET", "/api/conversations", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    let mut bad = request("GET", "/api/conversations", None, None);
    bad.headers_mut()
        .insert(USER_ID_HEADER, "not-a-uuid".parse().unwrap());
    assert_eq!(send(&app, bad).await.0, StatusCode::UNAUTHORIZED);

    let stranger = User {
        id: Uuid::new_v4(),
        username: "ghost".to_string(),
        role: UserRole::Client,
        email: None,
        phone: None,
        created_at: Utc::now(),
    };
    let (status, _) = send(&app, request("GET", "/api/conversations", Some(&stranger), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_messaging_flow_with_polling_fallback() {
    let app = setup().await;
    let conversation_id = create_conversation(&app, &app.ada, &app.bob).await;
    let messages_uri = format!("/api/conversations/{}/messages", conversation_id);

    let (status, message) = send(
        &app,
        request("POST", &messages_uri, Some(&app.ada), Some(json!({ "body": " hi bob " }))),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(message["body"], "hi bob");

    // Bob was offline: unread counters and a notification to poll
    let (_, unread) = send(&app, request("GET", "/api/messages/unread-count", Some(&app.bob), None)).await;
    assert_eq!(unread["unread"], 1);
    let (_, unread) = send(
        &app,
        request("GET", "/api/notifications/unread-count", Some(&app.bob), None),
    )
    .await;
    assert_eq!(unread["unread"], 1);
    let (_, notifications) = send(
        &app,
        request("GET", "/api/notifications?unread_only=true", Some(&app.bob), None),
    )
    .await;
    assert_eq!(notifications[0]["title"], "New message from ada");

    let (status, history) = send(&app, request("GET", &messages_uri, Some(&app.bob), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history.as_array().unwrap().len(), 1);

    let (_, read) = send(
        &app,
        request(
            "POST",
            &format!("/api/conversations/{}/read", conversation_id),
            Some(&app.bob),
            None,
        ),
    )
    .await;
    assert_eq!(read["messages_marked"], 1);

    let (_, conversations) = send(&app, request("GET", "/api/conversations", Some(&app.bob), None)).await;
    assert_eq!(conversations[0]["unread_count"], 0);
}

#[tokio::test]
async fn test_message_errors_map_to_statuses() {
    let app = setup().await;
    let conversation_id = create_conversation(&app, &app.ada, &app.admin).await;
    let messages_uri = format!("/api/conversations/{}/messages", conversation_id);

    let (status, body) = send(
        &app,
        request("POST", &messages_uri, Some(&app.ada), Some(json!({ "body": "   " }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("empty"));

    let (status, _) = send(
        &app,
        request("POST", &messages_uri, Some(&app.bob), Some(json!({ "body": "hi" }))),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &app,
        request(
            "GET",
            &format!("/api/conversations/{}/messages", Uuid::new_v4()),
            Some(&app.ada),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_requests_get_json_errors() {
    let app = setup().await;
    let conversation_id = create_conversation(&app, &app.ada, &app.admin).await;

    let (status, body) = send(
        &app,
        request(
            "GET",
            "/api/conversations/not-a-uuid/messages",
            Some(&app.ada),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, body) = send(
        &app,
        request(
            "GET",
            &format!("/api/conversations/{}/messages?before=yesterday", conversation_id),
            Some(&app.ada),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let broken_json = Request::builder()
        .method("POST")
        .uri("/api/conversations")
        .header(USER_ID_HEADER, app.ada.id.to_string())
        .header("content-type", "application/json")
        .body(Body::from("{\"participant_ids\": ["))
        .unwrap();
    let (status, body) = send(&app, broken_json).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, body) = send(
        &app,
        request(
            "POST",
            &format!("/api/appointments/{}/respond", Uuid::new_v4()),
            Some(&app.ada),
            Some(json!({ "note": "missing the answer" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_appointment_flow() {
    let app = setup().await;
    let starts_at = Utc::now() + chrono::Duration::days(3);
    let proposal = json!({
        "client_id": app.ada.id,
        "title": "Photo shoot",
        "starts_at": starts_at,
        "ends_at": starts_at + chrono::Duration::hours(1),
    });

    let (status, _) = send(
        &app,
        request("POST", "/api/appointments", Some(&app.bob), Some(proposal.clone())),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, appointment) = send(
        &app,
        request("POST", "/api/appointments", Some(&app.admin), Some(proposal)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(appointment["status"], "pending");
    let id = appointment["id"].as_str().unwrap().to_string();

    let respond_uri = format!("/api/appointments/{}/respond", id);
    let (status, accepted) = send(
        &app,
        request("POST", &respond_uri, Some(&app.ada), Some(json!({ "accept": true }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(accepted["status"], "accepted");

    let (status, _) = send(
        &app,
        request("POST", &respond_uri, Some(&app.ada), Some(json!({ "accept": false }))),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, cancelled) = send(
        &app,
        request("POST", &format!("/api/appointments/{}/cancel", id), Some(&app.admin), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "cancelled");

    let (_, listed) = send(&app, request("GET", "/api/appointments", Some(&app.ada), None)).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_notifications_and_preferences() {
    let app = setup().await;

    let (status, _) = send(
        &app,
        request(
            "POST",
            "/api/notifications",
            Some(&app.ada),
            Some(json!({ "user_ids": [app.bob.id], "title": "Hi" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, outcomes) = send(
        &app,
        request(
            "POST",
            "/api/notifications",
            Some(&app.admin),
            Some(json!({
                "user_ids": [app.ada.id, app.bob.id, Uuid::new_v4()],
                "title": "Studio closed Monday",
                "body": "Public holiday",
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let outcomes = outcomes.as_array().unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0]["in_app"], "queued");
    let notification_id = outcomes[0]["notification"]["id"].as_str().unwrap().to_string();

    let (_, deliveries) = send(
        &app,
        request(
            "GET",
            &format!("/api/notifications/{}/deliveries", notification_id),
            Some(&app.ada),
            None,
        ),
    )
    .await;
    let channels: Vec<&str> = deliveries
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["channel"].as_str().unwrap())
        .collect();
    assert_eq!(channels, vec!["in_app", "email", "sms"]);

    let (status, _) = send(
        &app,
        request(
            "GET",
            &format!("/api/notifications/{}/deliveries", notification_id),
            Some(&app.bob),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, read) = send(
        &app,
        request(
            "POST",
            &format!("/api/notifications/{}/read", notification_id),
            Some(&app.ada),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(read["read"], true);

    let (_, cleared) = send(
        &app,
        request("POST", "/api/notifications/read-all", Some(&app.bob), None),
    )
    .await;
    assert_eq!(cleared["marked"], 1);

    let (status, prefs) = send(
        &app,
        request(
            "PUT",
            "/api/notification-preferences",
            Some(&app.ada),
            Some(json!({ "in_app": true, "email": false, "sms": false })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(prefs["email"], false);
    let (_, prefs) = send(
        &app,
        request("GET", "/api/notification-preferences", Some(&app.ada), None),
    )
    .await;
    assert_eq!(prefs["user_id"], app.ada.id.to_string());
    assert_eq!(prefs["sms"], false);
}

#[tokio::test]
async fn test_templates_admin_only() {
    let app = setup().await;

    let (status, _) = send(&app, request("GET", "/api/templates", Some(&app.ada), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &app,
        request(
            "PUT",
            "/api/templates/new_message",
            Some(&app.admin),
            Some(json!({
                "channel": "in_app",
                "subject": "{{sender}} wrote to you",
                "body": "{{preview}}",
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // The edited template drives the next offline notification
    let conversation_id = create_conversation(&app, &app.ada, &app.bob).await;
    send(
        &app,
        request(
            "POST",
            &format!("/api/conversations/{}/messages", conversation_id),
            Some(&app.ada),
            Some(json!({ "body": "hello" })),
        ),
    )
    .await;
    let (_, notifications) = send(&app, request("GET", "/api/notifications", Some(&app.bob), None)).await;
    assert_eq!(notifications[0]["title"], "ada wrote to you");
    assert_eq!(notifications[0]["body"], "hello");

    let (_, templates) = send(&app, request("GET", "/api/templates", Some(&app.admin), None)).await;
    assert_eq!(templates.as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn test_event_stream_snapshot_then_live_events() {
    let app = setup().await;
    let conversation_id = create_conversation(&app, &app.ada, &app.bob).await;

    let response = app
        .router
        .clone()
        .oneshot(request("GET", "/api/events", Some(&app.bob), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    let mut frames = response.into_body().into_data_stream();

    let first = tokio::time::timeout(Duration::from_secs(2), frames.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let first = String::from_utf8(first.to_vec()).unwrap();
    assert!(first.contains("event: Connected"), "got {}", first);

    let (_, connections) = send(
        &app,
        request("GET", "/api/admin/connections", Some(&app.admin), None),
    )
    .await;
    assert_eq!(connections["connection_count"], 1);
    assert_eq!(connections["online_users"][0]["user_id"], app.bob.id.to_string());

    send(
        &app,
        request(
            "POST",
            &format!("/api/conversations/{}/messages", conversation_id),
            Some(&app.ada),
            Some(json!({ "body": "live" })),
        ),
    )
    .await;

    let next = tokio::time::timeout(Duration::from_secs(2), frames.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let next = String::from_utf8(next.to_vec()).unwrap();
    assert!(next.contains("event: MessageCreated"), "got {}", next);
    assert!(next.contains("\"body\":\"live\""));

    // Bob was online, so no notification was persisted
    let (_, unread) = send(
        &app,
        request("GET", "/api/notifications/unread-count", Some(&app.bob), None),
    )
    .await;
    assert_eq!(unread["unread"], 0);

    drop(frames);
    let (_, health) = send(&app, request("GET", "/health", None, None)).await;
    assert_eq!(health["connections"], 0);
}

#[tokio::test]
async fn test_admin_routes_reject_clients() {
    let app = setup().await;
    let (status, _) = send(&app, request("GET", "/api/admin/connections", Some(&app.ada), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = send(&app, request("GET", "/api/admin/events", Some(&app.ada), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_sqlite_backend_serves_same_api() {
    let dir = tempfile::tempdir().unwrap();
    let pool = chub_common::db::init_database(&dir.path().join("creatorhub.db"))
        .await
        .unwrap();
    let app = setup_with(Arc::new(SqliteStorage::new(pool))).await;

    let conversation_id = create_conversation(&app, &app.ada, &app.bob).await;
    let messages_uri = format!("/api/conversations/{}/messages", conversation_id);
    for body in ["one", "two", "three"] {
        let (status, _) = send(
            &app,
            request("POST", &messages_uri, Some(&app.ada), Some(json!({ "body": body }))),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (_, page) = send(
        &app,
        request("GET", &format!("{}?limit=2", messages_uri), Some(&app.bob), None),
    )
    .await;
    let bodies: Vec<&str> = page
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["body"].as_str().unwrap())
        .collect();
    assert_eq!(bodies, vec!["two", "three"]);

    let (_, unread) = send(&app, request("GET", "/api/messages/unread-count", Some(&app.bob), None)).await;
    assert_eq!(unread["unread"], 3);
}
