//! HTTP request handlers for Relaygram Server

pub mod account;
pub mod admin;
pub mod auth;
pub mod broadcasts;
pub mod health;
pub mod messages;
pub mod phone;
pub mod updates;
pub mod websocket;

use axum::{
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, Request},
    http::request::Parts,
    Json,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use serde::de::DeserializeOwned;

use crate::{
    auth::{AdminClaims, AuthUser},
    error::AppError,
    models::Admin,
    AppState,
};

/// Authenticated client, resolved from the transport key headers.
#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        state.sessions.authenticate(&parts.headers).await
    }
}

/// Authenticated admin, from `Authorization: Bearer <JWT>`.
#[derive(Debug, Clone)]
pub struct AdminAuth {
    pub admin: Admin,
    pub claims: AdminClaims,
}

impl AdminAuth {
    pub fn id(&self) -> i64 {
        self.admin.id
    }
}

/// Check a token and make sure the admin behind it is still active.
pub async fn verify_admin_token(state: &AppState, token: &str) -> Result<AdminAuth, AppError> {
    let claims = state.jwt.verify(token)?;
    let admin = state
        .storage
        .get_admin(claims.admin_id)
        .await?
        .filter(|a| a.is_active)
        .ok_or(AppError::Unauthenticated)?;

    Ok(AdminAuth { admin, claims })
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::Unauthenticated)?;

        verify_admin_token(state, bearer.token()).await
    }
}

/// JSON body whose parse failures use the shared error envelope.
pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(json_rejection(rejection)),
        }
    }
}

fn json_rejection(rejection: JsonRejection) -> AppError {
    AppError::InvalidArgument(rejection.body_text())
}
