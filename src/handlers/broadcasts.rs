//! Broadcast handlers (admin only)

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_json::{json, Value};

use crate::{error::Result, models::*, AppState};

use super::{AdminAuth, ApiJson};

/// Create a broadcast; delivery continues after the response
pub async fn send_broadcast(
    State(state): State<AppState>,
    admin: AdminAuth,
    ApiJson(req): ApiJson<SendBroadcastRequest>,
) -> Result<Json<SendBroadcastResponse>> {
    Ok(Json(state.broadcasts.send(admin.id(), &req).await?))
}

pub async fn list_broadcasts(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<Broadcast>>> {
    Ok(Json(state.broadcasts.list(&page).await?))
}

pub async fn get_broadcast(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<i64>,
) -> Result<Json<BroadcastWithDetails>> {
    Ok(Json(state.broadcasts.get(id).await?))
}

/// Re-deliver to the recipients whose last attempt failed
pub async fn retry_broadcast(
    State(state): State<AppState>,
    admin: AdminAuth,
    Path(id): Path<i64>,
) -> Result<Json<Value>> {
    let queued = state.broadcasts.retry(id).await?;
    tracing::info!(broadcast_id = id, admin_id = admin.id(), queued = queued, "Broadcast retry requested");

    Ok(Json(json!({ "ok": true, "id": id, "retrying": queued })))
}
