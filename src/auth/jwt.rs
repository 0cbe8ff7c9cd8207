//! Admin console tokens: HS256, carrying `{admin_id, username, role, exp}`.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{unix_now, Admin};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminClaims {
    pub admin_id: i64,
    pub username: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_hours: i64,
}

impl JwtKeys {
    pub fn new(secret: &str, ttl_hours: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl_hours,
        }
    }

    /// Returns the token and its expiry (Unix seconds).
    pub fn issue(&self, admin: &Admin) -> Result<(String, i64)> {
        let now = unix_now();
        let claims = AdminClaims {
            admin_id: admin.id,
            username: admin.username.clone(),
            role: admin.role.clone(),
            iat: now,
            exp: now + self.ttl_hours * 3600,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to sign token: {}", e)))?;

        Ok((token, claims.exp))
    }

    pub fn verify(&self, token: &str) -> Result<AdminClaims> {
        let validation = Validation::new(Algorithm::HS256);
        decode::<AdminClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!("Rejected admin token: {}", e);
                AppError::Unauthenticated
            })
    }
}
