//! WebSocket upgrade handlers for the client and admin push streams

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{header::ORIGIN, HeaderMap},
    response::Response,
};
use axum_extra::headers::{authorization::Bearer, Authorization, HeaderMapExt};
use serde::Deserialize;

use crate::{
    auth::session::extract_key_id,
    error::{AppError, Result},
    hub::socket::{self, PumpConfig, MAX_MESSAGE_SIZE},
    AppState,
};

use super::verify_admin_token;

#[derive(Debug, Deserialize)]
pub struct ClientWsQuery {
    pub auth_key_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AdminWsQuery {
    pub token: Option<String>,
}

/// Per-user update stream. Browsers cannot set headers on an upgrade, so the
/// key may also come as `?auth_key_id=`.
pub async fn client_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ClientWsQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let key = extract_key_id(&headers).or(query.auth_key_id);
    let auth = state.sessions.authenticate_key(key).await?;
    let user_id = auth.id();
    let hub = state.updates.hub().clone();

    tracing::info!(user_id = user_id, "Client WebSocket connected");

    Ok(ws
        .max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| async move {
            match hub.register(user_id).await {
                Some(subscription) => socket::run(socket, hub, subscription, PumpConfig::default()).await,
                None => tracing::error!("Client hub is not running"),
            }
        }))
}

/// Admin notification stream, authenticated with the console JWT.
pub async fn admin_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<AdminWsQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    check_origin(&headers, &state.config.admin.allowed_origins)?;

    let token = headers
        .typed_get::<Authorization<Bearer>>()
        .map(|Authorization(bearer)| bearer.token().to_string())
        .or(query.token)
        .ok_or(AppError::Unauthenticated)?;
    let admin = verify_admin_token(&state, &token).await?;
    let admin_id = admin.id();
    let hub = state.notifier.hub().clone();

    tracing::info!(admin_id = admin_id, "Admin WebSocket connected");

    Ok(ws
        .max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| async move {
            match hub.register(admin_id).await {
                Some(subscription) => socket::run(socket, hub, subscription, PumpConfig::default()).await,
                None => tracing::error!("Admin hub is not running"),
            }
        }))
}

/// An empty allow-list accepts every origin; requests without an `Origin`
/// header are not browser requests and pass.
fn check_origin(headers: &HeaderMap, allowed: &[String]) -> Result<()> {
    if allowed.is_empty() {
        return Ok(());
    }
    let Some(origin) = headers.get(ORIGIN).and_then(|v| v.to_str().ok()) else {
        return Ok(());
    };

    if allowed.iter().any(|a| a.eq_ignore_ascii_case(origin)) {
        Ok(())
    } else {
        tracing::warn!(origin = %origin, "Rejected admin WebSocket origin");
        Err(AppError::Forbidden("origin not allowed".into()))
    }
}
