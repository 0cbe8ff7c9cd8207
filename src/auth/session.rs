//! Transport-key session binding.
//!
//! Every client request carries an opaque 64-bit key id in `X-Auth-Key-ID`
//! (or, for older clients, as the raw `Authorization` value). A key bound to a
//! user grants that user's identity; when a key has several sessions the most
//! recently active one wins.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use std::sync::Arc;
use std::time::Duration;

use crate::{
    ephemeral::{self, EphemeralStore},
    error::{AppError, Result},
    models::*,
    storage::Storage,
};

pub const AUTH_KEY_HEADER: &str = "x-auth-key-id";

/// Key id from `X-Auth-Key-ID`, falling back to the raw `Authorization` value.
pub fn extract_key_id(headers: &HeaderMap) -> Option<i64> {
    let raw = headers
        .get(AUTH_KEY_HEADER)
        .or_else(|| headers.get(AUTHORIZATION))?
        .to_str()
        .ok()?;
    raw.trim().parse().ok()
}

/// The identity attached to an authenticated request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: User,
    pub auth_key_id: i64,
}

impl AuthUser {
    pub fn id(&self) -> i64 {
        self.user.id
    }
}

/// Fails with `Forbidden` while a ban is in force.
pub fn ensure_not_banned(user: &User, now: i64) -> Result<()> {
    match user.active_ban(now) {
        Some(reason) => Err(AppError::Forbidden(reason)),
        None => Ok(()),
    }
}

#[derive(Clone)]
pub struct SessionBinder {
    storage: Arc<Storage>,
    ephemeral: Arc<EphemeralStore>,
    presence_ttl: Duration,
}

impl SessionBinder {
    pub fn new(storage: Arc<Storage>, ephemeral: Arc<EphemeralStore>, presence_ttl: Duration) -> Self {
        Self {
            storage,
            ephemeral,
            presence_ttl,
        }
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthUser> {
        self.authenticate_key(extract_key_id(headers)).await
    }

    pub async fn authenticate_key(&self, key_id: Option<i64>) -> Result<AuthUser> {
        let key_id = key_id.ok_or(AppError::Unauthenticated)?;

        let session = self
            .storage
            .latest_session(key_id)
            .await?
            .ok_or(AppError::Unauthenticated)?;

        let user = self
            .storage
            .get_user(session.user_id)
            .await?
            .filter(|u| !u.is_deleted)
            .ok_or(AppError::Unauthenticated)?;

        let now = unix_now();
        ensure_not_banned(&user, now)?;

        if let Err(e) = self.storage.touch_session(session.id, now).await {
            tracing::warn!(session_id = session.id, "Failed to refresh session activity: {}", e);
        }
        self.mark_online(user.id);

        Ok(AuthUser {
            user,
            auth_key_id: key_id,
        })
    }

    pub async fn bind_key(&self, key_id: i64, user_id: i64) -> Result<()> {
        self.storage.bind_key(key_id, user_id, unix_now()).await?;
        tracing::info!(auth_key_id = key_id, user_id = user_id, "Transport key bound");
        Ok(())
    }

    /// The live user behind a key, without ban or presence side effects.
    pub async fn resolve_user(&self, key_id: i64) -> Result<Option<User>> {
        let Some(session) = self.storage.latest_session(key_id).await? else {
            return Ok(None);
        };
        Ok(self
            .storage
            .get_user(session.user_id)
            .await?
            .filter(|u| !u.is_deleted))
    }

    /// Refresh the presence marker. The database write runs detached and is best-effort.
    pub fn mark_online(&self, user_id: i64) {
        self.ephemeral
            .set(ephemeral::online_key(user_id), "1", self.presence_ttl);

        let storage = Arc::clone(&self.storage);
        tokio::spawn(async move {
            if let Err(e) = storage
                .touch_last_online(user_id, UserStatus::Online, unix_now())
                .await
            {
                tracing::warn!(user_id = user_id, "Failed to record presence: {}", e);
            }
        });
    }

    pub async fn mark_offline(&self, user_id: i64) -> Result<()> {
        self.ephemeral.delete(&ephemeral::online_key(user_id));
        self.storage
            .touch_last_online(user_id, UserStatus::Offline, unix_now())
            .await?;
        Ok(())
    }

    pub fn is_online(&self, user_id: i64) -> bool {
        self.ephemeral.contains(&ephemeral::online_key(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    async fn binder() -> (SessionBinder, Arc<Storage>) {
        let storage = Arc::new(Storage::in_memory().await.unwrap());
        let binder = SessionBinder::new(
            Arc::clone(&storage),
            Arc::new(EphemeralStore::new()),
            Duration::from_secs(300),
        );
        (binder, storage)
    }

    #[test]
    fn test_key_header_precedence() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_key_id(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("42"));
        assert_eq!(extract_key_id(&headers), Some(42));

        headers.insert(AUTH_KEY_HEADER, HeaderValue::from_static("-7"));
        assert_eq!(extract_key_id(&headers), Some(-7));
    }

    #[tokio::test]
    async fn test_unbound_key_is_unauthenticated() {
        let (binder, _) = binder().await;
        assert!(matches!(binder.authenticate_key(None).await, Err(AppError::Unauthenticated)));
        assert!(matches!(binder.authenticate_key(Some(9)).await, Err(AppError::Unauthenticated)));
    }

    #[tokio::test]
    async fn test_bound_key_authenticates_and_marks_online() {
        let (binder, storage) = binder().await;
        let user = storage.create_user("+1", "A", None, 1).await.unwrap();
        binder.bind_key(500, user.id).await.unwrap();

        let auth = binder.authenticate_key(Some(500)).await.unwrap();
        assert_eq!(auth.id(), user.id);
        assert!(binder.is_online(user.id));
    }

    #[tokio::test]
    async fn test_banned_and_deleted_users_are_rejected() {
        let (binder, storage) = binder().await;
        let banned = storage.create_user("+1", "A", None, 1).await.unwrap();
        let deleted = storage.create_user("+2", "B", None, 1).await.unwrap();
        binder.bind_key(1, banned.id).await.unwrap();
        binder.bind_key(2, deleted.id).await.unwrap();

        storage
            .ban_user(banned.id, Some("spam"), Some(unix_now() + 3600))
            .await
            .unwrap();
        storage.soft_delete_user(deleted.id).await.unwrap();

        match binder.authenticate_key(Some(1)).await {
            Err(AppError::Forbidden(reason)) => assert_eq!(reason, "spam"),
            other => panic!("expected ban, got {other:?}"),
        }
        assert!(matches!(binder.authenticate_key(Some(2)).await, Err(AppError::Unauthenticated)));
        assert!(binder.resolve_user(2).await.unwrap().is_none());

        // an expired ban no longer applies
        storage.ban_user(banned.id, Some("spam"), Some(unix_now() - 1)).await.unwrap();
        assert!(binder.authenticate_key(Some(1)).await.is_ok());
    }
}
