//! Integration tests for Relaygram Server
//!
//! The router is driven in-process with `tower::ServiceExt::oneshot`; the
//! WebSocket test serves it on an ephemeral port.

use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use relaygram_server::{
    build_router,
    config::Config,
    crypto,
    ephemeral,
    models::{unix_now, UpdateType, WsEnvelope},
    storage::Storage,
    AppState,
};

async fn test_app() -> (AppState, Router) {
    let mut config = Config::default();
    config.admin.jwt_secret = "integration-secret".to_string();

    let storage = Storage::in_memory().await.unwrap();
    let state = AppState::new(config, storage);
    let app = build_router(state.clone());
    (state, app)
}

async fn call(app: &Router, method: Method, uri: &str, key: Option<i64>, body: Option<Value>) -> (StatusCode, Value) {
    call_with(app, method, uri, key, None, body).await
}

async fn call_with(
    app: &Router,
    method: Method,
    uri: &str,
    key: Option<i64>,
    bearer: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = key {
        builder = builder.header("X-Auth-Key-ID", key.to_string());
    }
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }

    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

/// A registered user bound to `key`.
async fn signed_in_user(state: &AppState, phone: &str, key: i64) -> i64 {
    let now = unix_now();
    let user = state.storage.create_user(phone, "Test", None, now).await.unwrap();
    state.storage.ensure_update_state(user.id, now).await.unwrap();
    state.sessions.bind_key(key, user.id).await.unwrap();
    user.id
}

async fn admin_token(state: &AppState, app: &Router) -> String {
    state
        .storage
        .create_admin("root", &crypto::hash_password("correct horse"), "admin", unix_now())
        .await
        .unwrap();

    let (status, body) = call(
        app,
        Method::POST,
        "/admin/login",
        None,
        Some(json!({ "username": "root", "password": "correct horse" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health_check() {
    let (_state, app) = test_app().await;

    let (status, body) = call(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["clients"], 0);
}

#[tokio::test]
async fn test_new_user_sign_up_flow() {
    let (state, app) = test_app().await;
    state.storage.allow_api(1, "X", unix_now()).await.unwrap();

    let (status, sent) = call(
        &app,
        Method::POST,
        "/auth/sendCode",
        None,
        Some(json!({ "phone": "+15550001", "api_id": 1, "api_hash": "X" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sent["_"], "auth.sentCode");
    assert_eq!(sent["type"]["length"], 6);
    let hash = sent["phone_code_hash"].as_str().unwrap().to_string();

    let code = state.ephemeral.get(&ephemeral::code_key("+15550001")).unwrap();
    let (status, auth) = call(
        &app,
        Method::POST,
        "/auth/signIn",
        Some(42),
        Some(json!({ "phone": "+15550001", "phone_code_hash": hash, "phone_code": code })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(auth["_"], "auth.authorizationSignUpRequired");
    assert!(!state.ephemeral.contains(&ephemeral::code_key("+15550001")));

    let (status, auth) = call(
        &app,
        Method::POST,
        "/auth/signUp",
        Some(42),
        Some(json!({ "phone": "+15550001", "phone_code_hash": hash, "first_name": "A" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(auth["_"], "auth.authorization");
    assert!(auth["user"]["id"].as_i64().unwrap() > 0);

    let (status, st) = call(&app, Method::GET, "/updates/getState", Some(42), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(st["_"], "updates.state");
    assert_eq!(st["pts"], 1);
}

#[tokio::test]
async fn test_sign_up_requires_prior_sign_in() {
    let (state, app) = test_app().await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/auth/signUp",
        Some(99),
        Some(json!({ "phone": "+15559999", "phone_code_hash": "anything", "first_name": "M" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "BAD_REQUEST");
    assert!(state.storage.get_user_by_phone("+15559999").await.unwrap().is_none());

    let (status, _) = call(&app, Method::GET, "/updates/getState", Some(99), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_send_code_rejects_unknown_api() {
    let (_state, app) = test_app().await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/auth/sendCode",
        None,
        Some(json!({ "phone": "+15550001", "api_id": 9, "api_hash": "nope" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);
    assert_eq!(body["error_code"], "API_ID_INVALID");
}

#[tokio::test]
async fn test_universal_code_sign_in() {
    let (state, app) = test_app().await;
    state.storage.add_universal_code("000000", unix_now()).await.unwrap();
    state.storage.create_user("+15550002", "F", None, unix_now()).await.unwrap();

    let (status, auth) = call(
        &app,
        Method::POST,
        "/auth/signIn",
        Some(7),
        Some(json!({ "phone": "+15550002", "phone_code_hash": "", "phone_code": "000000" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(auth["_"], "auth.authorization");

    let universal = state.storage.get_universal_code("000000").await.unwrap().unwrap();
    assert_eq!(universal.usage_count, 1);

    // The key now resolves to the user
    let (status, _) = call(&app, Method::GET, "/updates/getState", Some(7), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_unbound_key_is_unauthorized() {
    let (_state, app) = test_app().await;

    let (status, body) = call(&app, Method::GET, "/updates/getState", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], "UNAUTHORIZED");

    let (status, _) = call(&app, Method::GET, "/updates/getState", Some(12345), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_message_catch_up() {
    let (state, app) = test_app().await;
    let _alice = signed_in_user(&state, "+15550010", 10).await;
    let bob = signed_in_user(&state, "+15550011", 11).await;

    let (_, st) = call(&app, Method::GET, "/updates/getState", Some(10), None).await;
    assert_eq!(st["pts"], 1);

    for i in 0..3 {
        let (status, sent) = call(
            &app,
            Method::POST,
            "/messages/sendMessage",
            Some(10),
            Some(json!({ "peer_id": bob, "message": format!("hello {}", i) })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sent["_"], "updateShortSentMessage");
        assert_eq!(sent["pts"], 2 + i);
    }

    let (_, st) = call(&app, Method::GET, "/updates/getState", Some(10), None).await;
    assert_eq!(st["pts"], 4);

    let (status, diff) = call(&app, Method::POST, "/updates/getDifference", Some(10), Some(json!({ "pts": 1 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(diff["_"], "updates.difference");
    assert_eq!(diff["new_messages"].as_array().unwrap().len(), 3);
    assert_eq!(diff["state"]["pts"], 4);

    let (_, diff) = call(&app, Method::POST, "/updates/getDifference", Some(10), Some(json!({ "pts": 4 }))).await;
    assert_eq!(diff["_"], "updates.differenceEmpty");

    // Bob saw the same three messages and has them unread
    let (_, st) = call(&app, Method::GET, "/updates/getState", Some(11), None).await;
    assert_eq!(st["pts"], 4);
    assert_eq!(st["unread_count"], 3);
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let (state, app) = test_app().await;
    signed_in_user(&state, "+15550020", 20).await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/updates/getDifference",
        Some(20),
        Some(json!({ "pts": "not-a-number" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_banned_user_is_forbidden() {
    let (state, app) = test_app().await;
    let user = signed_in_user(&state, "+15550030", 30).await;
    let token = admin_token(&state, &app).await;

    let (status, _) = call_with(
        &app,
        Method::POST,
        &format!("/api/admin/users/{}/ban", user),
        None,
        Some(&token),
        Some(json!({ "reason": "spam" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, Method::GET, "/updates/getState", Some(30), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_code"], "FORBIDDEN");

    let (status, _) = call_with(
        &app,
        Method::POST,
        &format!("/api/admin/users/{}/unban", user),
        None,
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(&app, Method::GET, "/updates/getState", Some(30), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_call_handshake() {
    let (state, app) = test_app().await;
    let caller = signed_in_user(&state, "+15550040", 40).await;
    let callee = signed_in_user(&state, "+15550041", 41).await;

    let (status, requested) = call(
        &app,
        Method::POST,
        "/phone/requestCall",
        Some(40),
        Some(json!({ "user_id": callee, "g_a_hash": "qqqq" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(requested["phone_call"]["_"], "phoneCallRequested");
    assert_eq!(requested["phone_call"]["admin_id"], caller);
    let call_id = requested["phone_call"]["id"].as_i64().unwrap();

    // A second request for the same pair is refused while the first is open
    let (status, body) = call(
        &app,
        Method::POST,
        "/phone/requestCall",
        Some(41),
        Some(json!({ "user_id": caller, "g_a_hash": "qqqq" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_code"], "CONFLICT");

    let (status, waiting) = call(&app, Method::POST, "/phone/receivedCall", Some(41), Some(json!({ "call_id": call_id }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(waiting["phone_call"]["_"], "phoneCallWaiting");

    // Only the callee may accept
    let (status, body) = call(
        &app,
        Method::POST,
        "/phone/acceptCall",
        Some(40),
        Some(json!({ "call_id": call_id, "g_b": "u7u7", "key_fingerprint": 99 })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_code"], "FORBIDDEN");

    let (status, accepted) = call(
        &app,
        Method::POST,
        "/phone/acceptCall",
        Some(41),
        Some(json!({ "call_id": call_id, "g_b": "u7u7", "key_fingerprint": 99 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(accepted["phone_call"]["_"], "phoneCallAccepted");
    assert_eq!(accepted["phone_call"]["g_b"], "u7u7");

    let (status, confirmed) = call(
        &app,
        Method::POST,
        "/phone/confirmCall",
        Some(40),
        Some(json!({ "call_id": call_id, "key_fingerprint": 99 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(confirmed["phone_call"]["_"], "phoneCall");

    let (status, ended) = call(
        &app,
        Method::POST,
        "/phone/discardCall",
        Some(41),
        Some(json!({ "call_id": call_id, "reason": "hangup", "duration": 30 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ended["phone_call"]["_"], "phoneCallDiscarded");
    assert_eq!(ended["phone_call"]["duration"], 30);

    // Terminal states accept nothing further
    let (status, body) = call(
        &app,
        Method::POST,
        "/phone/confirmCall",
        Some(40),
        Some(json!({ "call_id": call_id, "key_fingerprint": 99 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_code"], "ILLEGAL_TRANSITION");

    // Every transition reached both parties' logs
    let (_, st) = call(&app, Method::GET, "/updates/getState", Some(40), None).await;
    assert_eq!(st["pts"], 6);
    let (_, diff) = call(&app, Method::POST, "/updates/getDifference", Some(41), Some(json!({ "pts": 1 }))).await;
    let kinds: Vec<&str> = diff["other_updates"]
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u["_"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["phoneCallUpdate"; 5]);

    // Outsiders cannot read the call
    signed_in_user(&state, "+15550042", 42).await;
    let (status, _) = call(&app, Method::POST, "/phone/getCall", Some(42), Some(json!({ "call_id": call_id }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_admin_login_rejects_bad_password() {
    let (state, app) = test_app().await;
    admin_token(&state, &app).await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/admin/login",
        None,
        Some(json!({ "username": "root", "password": "wrong" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["ok"], false);
}

#[tokio::test]
async fn test_broadcast_requires_admin_token() {
    let (_state, app) = test_app().await;

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/v1/broadcasts",
        None,
        Some(json!({ "message": "hi", "target_type": "all" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call_with(&app, Method::GET, "/api/v1/broadcasts", None, Some("garbage"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_broadcast_to_all_users() {
    let (state, app) = test_app().await;
    let token = admin_token(&state, &app).await;

    let mut recipients = Vec::new();
    for i in 0..5 {
        recipients.push(signed_in_user(&state, &format!("+1555010{}", i), 100 + i).await);
    }

    let mut admin_feed = state.notifier.hub().register(1).await.unwrap();

    let (status, created) = call_with(
        &app,
        Method::POST,
        "/api/v1/broadcasts",
        None,
        Some(&token),
        Some(json!({ "title": "Notice", "message": "maintenance tonight", "target_type": "all" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["total_users"], 5);
    let id = created["id"].as_i64().unwrap();

    let mut finished = None;
    for _ in 0..50 {
        let (_, body) = call_with(&app, Method::GET, &format!("/api/v1/broadcasts/{}", id), None, Some(&token), None).await;
        if body["status"] == "completed" {
            finished = Some(body);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let finished = finished.expect("broadcast never completed");
    assert_eq!(finished["success"], 5);
    assert_eq!(finished["failed"], 0);
    let details = finished["details"].as_array().unwrap();
    assert_eq!(details.len(), 5);
    assert!(details.iter().all(|d| d["status"] == "success"));

    // Each recipient got exactly one new update
    for (i, _) in recipients.iter().enumerate() {
        let (_, st) = call(&app, Method::GET, "/updates/getState", Some(100 + i as i64), None).await;
        assert_eq!(st["pts"], 2);
    }

    let event = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let frame = admin_feed.rx.recv().await.unwrap();
            let envelope: WsEnvelope = serde_json::from_str(&frame).unwrap();
            if envelope.category.as_deref() == Some("broadcast_complete") {
                return envelope;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event.data["success"], 5);
    assert_eq!(event.data["failed"], 0);

    // A completed broadcast has nothing to retry
    let (status, _) = call_with(
        &app,
        Method::POST,
        &format!("/api/v1/broadcasts/{}/retry", id),
        None,
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_client_websocket_receives_updates() {
    let (state, app) = test_app().await;
    let user = signed_in_user(&state, "+15550050", 50).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws?auth_key_id=50", addr))
        .await
        .unwrap();

    // Registration completes inside the upgrade callback
    for _ in 0..50 {
        if state.updates.hub().is_connected(&user) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(state.updates.hub().is_connected(&user));

    let pts = state
        .updates
        .append_update(user, UpdateType::UserStatus, &json!({ "user_id": user, "status": "online" }))
        .await
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("socket closed: {:?}", other),
            }
        }
    })
    .await
    .unwrap();

    let envelope: WsEnvelope = serde_json::from_str(&frame).unwrap();
    assert_eq!(envelope.kind, "update");
    assert_eq!(envelope.category.as_deref(), Some("userStatus"));
    assert_eq!(envelope.data["pts"], pts);
}

#[tokio::test]
async fn test_client_websocket_rejects_unbound_key() {
    let (_state, app) = test_app().await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let result = tokio_tungstenite::connect_async(format!("ws://{}/ws?auth_key_id=999", addr)).await;
    assert!(result.is_err());
}
