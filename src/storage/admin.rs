use sqlx::Result;

use super::Storage;
use crate::models::*;

const ADMIN_COLUMNS: &str = "id, username, password_hash, role, is_active, created_at, last_login";
const NOTIFICATION_COLUMNS: &str = "id, admin_id, category, priority, title, message, data, is_read, created_at";

impl Storage {
    // ========================================================================
    // Admin Operations
    // ========================================================================

    pub async fn create_admin(&self, username: &str, password_hash: &str, role: &str, now: i64) -> Result<Admin> {
        sqlx::query_as::<_, Admin>(&format!(
            "INSERT INTO admins (username, password_hash, role, is_active, created_at)
             VALUES (?, ?, ?, 1, ?)
             RETURNING {ADMIN_COLUMNS}"
        ))
        .bind(username)
        .bind(password_hash)
        .bind(role)
        .bind(now)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_admin(&self, admin_id: i64) -> Result<Option<Admin>> {
        sqlx::query_as::<_, Admin>(&format!("SELECT {ADMIN_COLUMNS} FROM admins WHERE id = ?"))
            .bind(admin_id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn get_admin_by_username(&self, username: &str) -> Result<Option<Admin>> {
        sqlx::query_as::<_, Admin>(&format!("SELECT {ADMIN_COLUMNS} FROM admins WHERE username = ?"))
            .bind(username)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn touch_admin_login(&self, admin_id: i64, now: i64) -> Result<()> {
        sqlx::query("UPDATE admins SET last_login = ? WHERE id = ?")
            .bind(now)
            .bind(admin_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ========================================================================
    // Notification Operations
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_notification(
        &self,
        admin_id: Option<i64>,
        category: &str,
        priority: &str,
        title: &str,
        message: &str,
        data: &str,
        now: i64,
    ) -> Result<i64> {
        sqlx::query_scalar(
            "INSERT INTO admin_notifications (admin_id, category, priority, title, message, data, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(admin_id)
        .bind(category)
        .bind(priority)
        .bind(title)
        .bind(message)
        .bind(data)
        .bind(now)
        .fetch_one(&self.pool)
        .await
    }

    /// Notifications addressed to everyone plus those addressed to `admin_id`, newest first.
    pub async fn list_notifications(&self, admin_id: i64, limit: i64, offset: i64) -> Result<Vec<AdminNotification>> {
        sqlx::query_as::<_, AdminNotification>(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM admin_notifications
             WHERE admin_id IS NULL OR admin_id = ?
             ORDER BY id DESC LIMIT ? OFFSET ?"
        ))
        .bind(admin_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn mark_notification_read(&self, id: i64, admin_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE admin_notifications SET is_read = 1 WHERE id = ? AND (admin_id IS NULL OR admin_id = ?)",
        )
        .bind(id)
        .bind(admin_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub async fn get_stats(&self, online_since: i64) -> Result<ServerStats> {
        let total_users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE is_deleted = 0")
            .fetch_one(&self.pool)
            .await?;

        let banned_users: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE is_deleted = 0 AND is_banned = 1")
                .fetch_one(&self.pool)
                .await?;

        let online_users: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE is_deleted = 0 AND last_online > ?")
                .bind(online_since)
                .fetch_one(&self.pool)
                .await?;

        let active_calls = self.count_open_calls().await?;
        let pending_broadcasts = self
            .count_broadcasts_with_status(BroadcastStatus::Pending)
            .await?;

        Ok(ServerStats {
            total_users,
            banned_users,
            online_users,
            connected_clients: 0, // Filled in from the hubs
            connected_admins: 0,
            active_calls,
            pending_broadcasts,
        })
    }
}
