//! Update log handlers

use axum::{extract::State, Json};

use crate::{auth::AuthUser, error::Result, models::*, AppState};

use super::ApiJson;

pub async fn get_state(State(state): State<AppState>, auth: AuthUser) -> Result<Json<StateView>> {
    let current = state.updates.current_state(auth.id()).await?;
    Ok(Json(current.into()))
}

pub async fn get_difference(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(req): ApiJson<GetDifferenceRequest>,
) -> Result<Json<Difference>> {
    let difference = state
        .updates
        .difference(auth.id(), req.pts, req.qts, req.date)
        .await?;

    Ok(Json(difference))
}
