//! Message handlers
//!
//! Messages are minimal one-to-one rows; what matters here is that every
//! change lands in the update log of each affected user.

use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::{
    auth::AuthUser,
    error::{AppError, Result},
    models::*,
    AppState,
};

use super::ApiJson;

fn affected(pts: i64, count: usize) -> Json<Value> {
    Json(json!({
        "_": "messages.affectedMessages",
        "pts": pts,
        "pts_count": count,
    }))
}

/// Send a text message to another user
pub async fn send_message(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(req): ApiJson<SendMessageRequest>,
) -> Result<Json<Value>> {
    let text = req.message.trim();
    if text.is_empty() {
        return Err(AppError::InvalidArgument("message is empty".into()));
    }

    let peer = state
        .storage
        .get_user(req.peer_id)
        .await?
        .filter(|u| !u.is_deleted)
        .ok_or_else(|| AppError::NotFound(format!("user {}", req.peer_id)))?;

    let message = state
        .storage
        .create_message(auth.id(), peer.id, text, unix_now())
        .await?;
    let payload = message.to_value();

    let pts = state
        .updates
        .append_update(auth.id(), UpdateType::NewMessage, &payload)
        .await?;
    if peer.id != auth.id() {
        state
            .updates
            .append_update(peer.id, UpdateType::NewMessage, &payload)
            .await?;
        state.storage.adjust_unread(peer.id, 1).await?;
    }

    Ok(Json(json!({
        "_": "updateShortSentMessage",
        "id": message.id,
        "date": message.date,
        "pts": pts,
        "pts_count": 1,
    })))
}

/// Edit a message the caller wrote
pub async fn edit_message(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(req): ApiJson<EditMessageRequest>,
) -> Result<Json<Value>> {
    let text = req.message.trim();
    if text.is_empty() {
        return Err(AppError::InvalidArgument("message is empty".into()));
    }

    let message = state
        .storage
        .edit_message(req.id, auth.id(), text, unix_now())
        .await?
        .ok_or_else(|| AppError::NotFound(format!("message {}", req.id)))?;
    let payload = message.to_value();

    let pts = state
        .updates
        .append_update(auth.id(), UpdateType::EditMessage, &payload)
        .await?;
    if message.peer_id != auth.id() {
        state
            .updates
            .append_update(message.peer_id, UpdateType::EditMessage, &payload)
            .await?;
    }

    Ok(Json(json!({
        "_": "updates",
        "message": payload,
        "pts": pts,
    })))
}

/// Mark a dialog read up to `max_id`
pub async fn read_history(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(req): ApiJson<ReadHistoryRequest>,
) -> Result<Json<Value>> {
    state.storage.reset_unread(auth.id()).await?;

    let pts = state
        .updates
        .append_update(
            auth.id(),
            UpdateType::ReadHistory,
            &json!({ "_": "updateReadHistoryInbox", "peer_id": req.peer_id, "max_id": req.max_id }),
        )
        .await?;

    // tell the other side its messages were read
    if req.peer_id != auth.id() && state.storage.get_user(req.peer_id).await?.is_some() {
        state
            .updates
            .append_update(
                req.peer_id,
                UpdateType::ReadHistory,
                &json!({ "_": "updateReadHistoryOutbox", "peer_id": auth.id(), "max_id": req.max_id }),
            )
            .await?;
    }

    Ok(affected(pts, 1))
}

/// Delete messages the caller sent or received
pub async fn delete_messages(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(req): ApiJson<DeleteMessagesRequest>,
) -> Result<Json<Value>> {
    if req.ids.is_empty() {
        return Err(AppError::InvalidArgument("ids is empty".into()));
    }

    let deleted = state.storage.delete_messages(&req.ids, auth.id()).await?;

    // one update per affected user, carrying the ids that user can see
    let mut per_user: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for message in &deleted {
        per_user.entry(message.from_id).or_default().push(message.id);
        if message.peer_id != message.from_id {
            per_user.entry(message.peer_id).or_default().push(message.id);
        }
    }
    per_user.entry(auth.id()).or_default();

    let mut own_pts = state.updates.current_state(auth.id()).await?.pts;
    for (user_id, ids) in per_user {
        if ids.is_empty() {
            continue;
        }
        let pts = state
            .updates
            .append_update(
                user_id,
                UpdateType::DeleteMessages,
                &json!({ "_": "updateDeleteMessages", "messages": ids }),
            )
            .await?;
        if user_id == auth.id() {
            own_pts = pts;
        }
    }

    Ok(affected(own_pts, deleted.len()))
}
