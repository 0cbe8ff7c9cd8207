//! Phone verification: `sendCode`, `signIn` and `signUp`.

use std::sync::Arc;
use std::time::Duration;

use super::session::{ensure_not_banned, SessionBinder};
use crate::{
    crypto,
    ephemeral::{self, EphemeralStore},
    error::{conflict_on_unique, AppError, Result},
    models::*,
    notify::{AdminEvent, Notifier},
    storage::Storage,
};

#[derive(Clone)]
pub struct Verification {
    storage: Arc<Storage>,
    ephemeral: Arc<EphemeralStore>,
    sessions: SessionBinder,
    notifier: Notifier,
    code_ttl: Duration,
}

fn normalize_phone(phone: &str) -> Result<String> {
    let phone = phone.trim();
    if phone.is_empty() {
        return Err(AppError::InvalidArgument("phone is required".into()));
    }
    if !phone.trim_start_matches('+').chars().all(|c| c.is_ascii_digit()) {
        return Err(AppError::InvalidArgument("phone must contain digits only".into()));
    }
    Ok(phone.to_string())
}

impl Verification {
    pub fn new(
        storage: Arc<Storage>,
        ephemeral: Arc<EphemeralStore>,
        sessions: SessionBinder,
        notifier: Notifier,
        code_ttl: Duration,
    ) -> Self {
        Self {
            storage,
            ephemeral,
            sessions,
            notifier,
            code_ttl,
        }
    }

    pub async fn send_code(&self, req: &SendCodeRequest) -> Result<SentCode> {
        let phone = normalize_phone(&req.phone)?;

        if !self.storage.is_api_allowed(req.api_id, &req.api_hash).await? {
            tracing::warn!(api_id = req.api_id, "Rejected sendCode from unknown API credentials");
            return Err(AppError::InvalidApi);
        }

        let code = crypto::generate_verification_code();
        self.ephemeral
            .set(ephemeral::code_key(&phone), code, self.code_ttl);

        let is_new = self.storage.get_user_by_phone(&phone).await?.is_none();
        tracing::info!(phone = %phone, is_new = is_new, "Verification code issued");

        Ok(SentCode {
            kind: "auth.sentCode",
            code_type: SentCodeType {
                kind: "auth.sentCodeTypeSms",
                length: crypto::VERIFICATION_CODE_LENGTH,
            },
            phone_code_hash: crypto::generate_phone_code_hash(),
            timeout: self.code_ttl.as_secs(),
            is_new,
        })
    }

    /// Check the code, then either sign the user in or ask for sign-up.
    /// An active universal code stands in for the per-phone code and is only
    /// counted once the sign-in is allowed to proceed.
    pub async fn sign_in(&self, req: &SignInRequest, auth_key_id: Option<i64>) -> Result<Authorization> {
        let phone = normalize_phone(&req.phone)?;
        let code = req.phone_code.trim();
        if code.is_empty() {
            return Err(AppError::InvalidArgument("phone_code is required".into()));
        }

        let universal = self
            .storage
            .get_universal_code(code)
            .await?
            .is_some_and(|u| u.is_active);
        if !universal && !self.ephemeral.take_if_eq(&ephemeral::code_key(&phone), code) {
            return Err(AppError::InvalidArgument("PHONE_CODE_INVALID".into()));
        }

        let Some(user) = self.storage.get_user_by_phone(&phone).await? else {
            if universal {
                self.count_universal_code(code, &phone).await?;
            }
            self.ephemeral.set(
                ephemeral::signup_key(&phone),
                req.phone_code_hash.clone(),
                self.code_ttl,
            );
            return Ok(Authorization::SignUpRequired {
                phone_code_hash: req.phone_code_hash.clone(),
            });
        };

        if user.is_deleted {
            return Err(AppError::Forbidden("USER_DEACTIVATED".into()));
        }
        ensure_not_banned(&user, unix_now())?;
        if universal {
            self.count_universal_code(code, &phone).await?;
        }

        if let Some(key) = auth_key_id {
            self.sessions.bind_key(key, user.id).await?;
        }
        self.sessions.mark_online(user.id);
        self.notifier.publish(AdminEvent::user_logged_in(&user));

        tracing::info!(user_id = user.id, "User signed in");
        Ok(Authorization::Authorized { user: user.into() })
    }

    /// Register the phone that a preceding `sign_in` answered with
    /// `SignUpRequired`. The pending entry is single use.
    pub async fn sign_up(&self, req: &SignUpRequest, auth_key_id: Option<i64>) -> Result<Authorization> {
        let phone = normalize_phone(&req.phone)?;
        let first_name = req.first_name.trim();
        if first_name.is_empty() {
            return Err(AppError::InvalidArgument("first_name is required".into()));
        }

        if !self
            .ephemeral
            .take_if_eq(&ephemeral::signup_key(&phone), &req.phone_code_hash)
        {
            tracing::warn!(phone = %phone, "signUp without a pending sign-in");
            return Err(AppError::InvalidArgument("PHONE_CODE_EXPIRED".into()));
        }

        if self.storage.get_user_by_phone(&phone).await?.is_some() {
            return Err(AppError::Conflict("PHONE_NUMBER_OCCUPIED".into()));
        }

        let now = unix_now();
        let last_name = req.last_name.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let user = self
            .storage
            .create_user(&phone, first_name, last_name, now)
            .await
            .map_err(|e| conflict_on_unique(e, "PHONE_NUMBER_OCCUPIED"))?;
        self.storage.ensure_update_state(user.id, now).await?;

        if let Some(key) = auth_key_id {
            self.sessions.bind_key(key, user.id).await?;
        }
        self.sessions.mark_online(user.id);
        self.notifier.publish(AdminEvent::user_registered(&user));

        tracing::info!(user_id = user.id, "User registered");
        Ok(Authorization::Authorized { user: user.into() })
    }

    async fn count_universal_code(&self, code: &str, phone: &str) -> Result<()> {
        // deactivated between lookup and use
        if !self.storage.consume_universal_code(code).await? {
            return Err(AppError::InvalidArgument("PHONE_CODE_INVALID".into()));
        }
        tracing::info!(phone = %phone, "Universal code accepted");
        Ok(())
    }
}
