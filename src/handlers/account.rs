//! Account handlers

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::{auth::AuthUser, error::Result, models::*, AppState};

use super::ApiJson;

/// Set the caller online or offline and record it in the update log
pub async fn update_status(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(req): ApiJson<UpdateStatusRequest>,
) -> Result<Json<Value>> {
    let status = if req.offline {
        state.sessions.mark_offline(auth.id()).await?;
        UserStatus::Offline
    } else {
        state.sessions.mark_online(auth.id());
        UserStatus::Online
    };

    state
        .updates
        .append_update(
            auth.id(),
            UpdateType::UserStatus,
            &json!({
                "_": "updateUserStatus",
                "user_id": auth.id(),
                "status": status.as_str(),
                "date": unix_now(),
            }),
        )
        .await?;

    Ok(Json(json!(true)))
}
