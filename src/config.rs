//! Configuration management for Relaygram Server

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub admin: AdminConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: String,
    pub update_retention_hours: u64,
    pub cleanup_interval_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// HS256 signing key for admin tokens. Overridden by `ADMIN_JWT_SECRET`,
    /// then `JWT_SECRET`. The server refuses to start while this is empty.
    #[serde(default)]
    pub jwt_secret: String,
    pub token_ttl_hours: i64,
    /// Origins accepted on the admin WebSocket. Empty accepts any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub difference_limit: i64,
    pub hub_queue_capacity: usize,
    pub presence_ttl_seconds: u64,
    pub code_ttl_seconds: u64,
}

impl Config {
    pub async fn load(path: &str) -> anyhow::Result<Self> {
        let mut config = if Path::new(path).exists() {
            let content = fs::read_to_string(path).await?;
            toml::from_str::<Config>(&content)?
        } else {
            let config = Config::default();
            let content = toml::to_string_pretty(&config)?;
            fs::write(path, content).await?;
            tracing::info!("Created default config at {}", path);
            config
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overlay environment variables on top of the file values.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(secret) = non_empty("ADMIN_JWT_SECRET").or_else(|| non_empty("JWT_SECRET")) {
            self.admin.jwt_secret = secret;
        }
        if let Some(path) = non_empty("DATABASE_PATH") {
            self.storage.database_path = path;
        }
    }

    /// Fails closed when no admin signing key is available.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.admin.jwt_secret.trim().is_empty() {
            anyhow::bail!("admin JWT secret is not configured; set ADMIN_JWT_SECRET or JWT_SECRET");
        }
        if self.limits.hub_queue_capacity == 0 {
            anyhow::bail!("limits.hub_queue_capacity must be positive");
        }
        if self.limits.difference_limit <= 0 {
            anyhow::bail!("limits.difference_limit must be positive");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                request_timeout_secs: 30,
            },
            storage: StorageConfig {
                database_path: "./data/relaygram.db".to_string(),
                update_retention_hours: 24,
                cleanup_interval_minutes: 10,
            },
            admin: AdminConfig {
                jwt_secret: String::new(),
                token_ttl_hours: 24,
                allowed_origins: Vec::new(),
            },
            limits: LimitsConfig {
                difference_limit: 100,
                hub_queue_capacity: 256,
                presence_ttl_seconds: 300,
                code_ttl_seconds: 300,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_admin_secret_prefers_admin_variable() {
        let env: HashMap<&str, &str> =
            [("ADMIN_JWT_SECRET", "admin-secret"), ("JWT_SECRET", "generic")].into();
        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.admin.jwt_secret, "admin-secret");
    }

    #[test]
    fn test_admin_secret_falls_back_to_generic_variable() {
        let env: HashMap<&str, &str> = [("ADMIN_JWT_SECRET", "  "), ("JWT_SECRET", "generic")].into();
        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.admin.jwt_secret, "generic");
    }

    #[test]
    fn test_missing_secret_fails_closed() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_database_path_override() {
        let env: HashMap<&str, &str> = [("DATABASE_PATH", "/var/lib/relaygram.db")].into();
        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.storage.database_path, "/var/lib/relaygram.db");
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.limits.hub_queue_capacity, 256);
        assert_eq!(parsed.storage.update_retention_hours, 24);
    }
}
