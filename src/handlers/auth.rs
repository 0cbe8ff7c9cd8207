//! Phone authentication handlers

use axum::{extract::State, http::HeaderMap, Json};

use crate::{auth::session::extract_key_id, error::Result, models::*, AppState};

use super::ApiJson;

/// Issue a verification code for a phone number
pub async fn send_code(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<SendCodeRequest>,
) -> Result<Json<SentCode>> {
    Ok(Json(state.verification.send_code(&req).await?))
}

/// Check a code; binds the caller's transport key on success
pub async fn sign_in(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<SignInRequest>,
) -> Result<Json<Authorization>> {
    let auth = state
        .verification
        .sign_in(&req, extract_key_id(&headers))
        .await?;

    Ok(Json(auth))
}

/// Register a new account. Rejected unless a sign-in for the same phone
/// returned `SignUpRequired` with the same `phone_code_hash`.
pub async fn sign_up(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<SignUpRequest>,
) -> Result<Json<Authorization>> {
    let auth = state
        .verification
        .sign_up(&req, extract_key_id(&headers))
        .await?;

    Ok(Json(auth))
}
