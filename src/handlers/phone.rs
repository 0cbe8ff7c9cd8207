//! Call signaling handlers

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::{auth::AuthUser, error::Result, models::*, AppState};

use super::ApiJson;

fn phone_call(call: &Call) -> Json<Value> {
    Json(json!({
        "_": "phone.phoneCall",
        "phone_call": PhoneCallView::from(call),
    }))
}

pub async fn request_call(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(req): ApiJson<RequestCallRequest>,
) -> Result<Json<Value>> {
    let call = state.calls.request_call(auth.id(), &req).await?;
    Ok(phone_call(&call))
}

pub async fn received_call(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(req): ApiJson<CallIdRequest>,
) -> Result<Json<Value>> {
    let call = state.calls.received_call(auth.id(), req.call_id).await?;
    Ok(phone_call(&call))
}

pub async fn accept_call(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(req): ApiJson<AcceptCallRequest>,
) -> Result<Json<Value>> {
    let call = state.calls.accept_call(auth.id(), &req).await?;
    Ok(phone_call(&call))
}

pub async fn confirm_call(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(req): ApiJson<ConfirmCallRequest>,
) -> Result<Json<Value>> {
    let call = state.calls.confirm_call(auth.id(), &req).await?;
    Ok(phone_call(&call))
}

pub async fn discard_call(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(req): ApiJson<DiscardCallRequest>,
) -> Result<Json<Value>> {
    let call = state.calls.discard_call(auth.id(), &req).await?;
    Ok(phone_call(&call))
}

pub async fn get_call(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(req): ApiJson<CallIdRequest>,
) -> Result<Json<Value>> {
    let call = state.calls.get_call(auth.id(), req.call_id).await?;
    Ok(phone_call(&call))
}
