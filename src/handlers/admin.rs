//! Admin console handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_json::{json, Value};

use crate::{
    crypto,
    error::{AppError, Result},
    models::*,
    AppState,
};

use super::{AdminAuth, ApiJson};

/// Exchange admin credentials for a JWT
pub async fn login(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<AdminLoginRequest>,
) -> Result<Json<AdminLoginResponse>> {
    let admin = state
        .storage
        .get_admin_by_username(req.username.trim())
        .await?
        .filter(|a| a.is_active)
        .filter(|a| crypto::verify_password(&req.password, &a.password_hash))
        .ok_or_else(|| {
            tracing::warn!(username = %req.username, "Failed admin login");
            AppError::Unauthenticated
        })?;

    let now = unix_now();
    state.storage.touch_admin_login(admin.id, now).await?;
    let (token, expires_at) = state.jwt.issue(&admin)?;

    tracing::info!(admin_id = admin.id, "Admin logged in");

    Ok(Json(AdminLoginResponse {
        token,
        expires_at,
        admin: Admin {
            last_login: Some(now),
            ..admin
        },
    }))
}

pub async fn list_notifications(
    State(state): State<AppState>,
    admin: AdminAuth,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<AdminNotification>>> {
    let notifications = state
        .storage
        .list_notifications(admin.id(), page.limit.clamp(1, 200), page.offset.max(0))
        .await?;

    Ok(Json(notifications))
}

pub async fn mark_notification_read(
    State(state): State<AppState>,
    admin: AdminAuth,
    Path(id): Path<i64>,
) -> Result<Json<Value>> {
    if !state.storage.mark_notification_read(id, admin.id()).await? {
        return Err(AppError::NotFound(format!("notification {}", id)));
    }

    Ok(Json(json!({ "ok": true })))
}

/// Get server statistics
pub async fn get_stats(State(state): State<AppState>, _admin: AdminAuth) -> Result<Json<ServerStats>> {
    let online_since = unix_now() - state.config.limits.presence_ttl_seconds as i64;
    let mut stats = state.storage.get_stats(online_since).await?;

    stats.connected_clients = state.updates.hub().client_count();
    stats.connected_admins = state.notifier.hub().client_count();

    Ok(Json(stats))
}

pub async fn ban_user(
    State(state): State<AppState>,
    admin: AdminAuth,
    Path(user_id): Path<i64>,
    ApiJson(req): ApiJson<BanUserRequest>,
) -> Result<Json<Value>> {
    let expires_at = match req.duration_seconds {
        Some(secs) if secs <= 0 => {
            return Err(AppError::InvalidArgument("duration_seconds must be positive".into()));
        }
        Some(secs) => Some(unix_now() + secs),
        None => None,
    };

    if !state
        .storage
        .ban_user(user_id, req.reason.as_deref(), expires_at)
        .await?
    {
        return Err(AppError::NotFound(format!("user {}", user_id)));
    }

    tracing::info!(admin_id = admin.id(), user_id = user_id, expires_at = ?expires_at, "User banned");

    Ok(Json(json!({ "ok": true, "user_id": user_id, "ban_expires_at": expires_at })))
}

pub async fn unban_user(
    State(state): State<AppState>,
    admin: AdminAuth,
    Path(user_id): Path<i64>,
) -> Result<Json<Value>> {
    if !state.storage.unban_user(user_id).await? {
        return Err(AppError::NotFound(format!("user {}", user_id)));
    }

    tracing::info!(admin_id = admin.id(), user_id = user_id, "User unbanned");

    Ok(Json(json!({ "ok": true, "user_id": user_id })))
}

/// Soft-delete a user; their transport keys stop resolving
pub async fn delete_user(
    State(state): State<AppState>,
    admin: AdminAuth,
    Path(user_id): Path<i64>,
) -> Result<Json<Value>> {
    if !state.storage.soft_delete_user(user_id).await? {
        return Err(AppError::NotFound(format!("user {}", user_id)));
    }

    tracing::info!(admin_id = admin.id(), user_id = user_id, "User deleted");

    Ok(Json(json!({ "ok": true, "user_id": user_id })))
}
