//! Database storage layer for Relaygram Server
//!
//! All persistent state lives in one SQLite database. Each operation is a
//! single statement or a short transaction; callers never hold a transaction
//! across an await point outside this module.

mod admin;
mod broadcasts;
mod calls;
mod messages;
mod updates;
mod users;

pub use calls::CallChanges;

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Pool, Sqlite,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_path: &str) -> anyhow::Result<Self> {
        // Ensure directory exists
        if let Some(parent) = Path::new(database_path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", database_path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// A private in-memory database. One connection, kept open for the
    /// lifetime of the pool, so every query sees the same data.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                access_hash INTEGER NOT NULL,
                phone TEXT NOT NULL UNIQUE,
                first_name TEXT NOT NULL DEFAULT '',
                last_name TEXT,
                username TEXT,
                status TEXT NOT NULL DEFAULT 'offline',
                last_online INTEGER NOT NULL DEFAULT 0,
                is_banned INTEGER NOT NULL DEFAULT 0,
                ban_expires_at INTEGER,
                ban_reason TEXT,
                is_bot INTEGER NOT NULL DEFAULT 0,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                auth_key_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                last_active INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (auth_key_id, user_id),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS api_credentials (
                api_id INTEGER PRIMARY KEY,
                api_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS universal_codes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL UNIQUE,
                is_active INTEGER NOT NULL DEFAULT 1,
                usage_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS update_states (
                user_id INTEGER PRIMARY KEY,
                pts INTEGER NOT NULL,
                qts INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                date INTEGER NOT NULL,
                unread_count INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                pts INTEGER NOT NULL,
                update_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                date INTEGER NOT NULL,
                UNIQUE (user_id, pts)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_id INTEGER NOT NULL,
                peer_id INTEGER NOT NULL,
                message TEXT NOT NULL,
                date INTEGER NOT NULL,
                edit_date INTEGER,
                is_deleted INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS calls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                access_hash INTEGER NOT NULL,
                caller_id INTEGER NOT NULL,
                callee_id INTEGER NOT NULL,
                is_video INTEGER NOT NULL DEFAULT 0,
                g_a_hash BLOB NOT NULL,
                g_b BLOB,
                key_fingerprint INTEGER,
                confirmed_fingerprint INTEGER,
                protocol TEXT,
                state TEXT NOT NULL,
                duration INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS broadcasts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                admin_id INTEGER NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                message TEXT NOT NULL,
                target_type TEXT NOT NULL,
                target_ids TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL,
                total INTEGER NOT NULL DEFAULT 0,
                success INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                scheduled_at INTEGER,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS broadcast_details (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                broadcast_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                attempts INTEGER NOT NULL DEFAULT 1,
                updated_at INTEGER NOT NULL,
                UNIQUE (broadcast_id, user_id),
                FOREIGN KEY (broadcast_id) REFERENCES broadcasts(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS admins (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'admin',
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                last_login INTEGER
            );

            CREATE TABLE IF NOT EXISTS admin_notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                admin_id INTEGER,
                category TEXT NOT NULL,
                priority TEXT NOT NULL,
                title TEXT NOT NULL,
                message TEXT NOT NULL,
                data TEXT NOT NULL DEFAULT '{}',
                is_read INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_key ON sessions(auth_key_id, last_active);
            CREATE INDEX IF NOT EXISTS idx_users_last_online ON users(last_online);
            CREATE INDEX IF NOT EXISTS idx_updates_date ON updates(date);
            CREATE INDEX IF NOT EXISTS idx_messages_peer ON messages(peer_id, id);
            CREATE INDEX IF NOT EXISTS idx_broadcasts_status ON broadcasts(status, scheduled_at);
            CREATE INDEX IF NOT EXISTS idx_notifications_created ON admin_notifications(created_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_calls_open_pair
                ON calls(min(caller_id, callee_id), max(caller_id, callee_id))
                WHERE state IN ('pending', 'ringing', 'accepted');
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
