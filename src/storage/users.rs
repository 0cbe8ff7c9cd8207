use sqlx::Result;

use super::Storage;
use crate::crypto;
use crate::models::*;

const USER_COLUMNS: &str = "id, access_hash, phone, first_name, last_name, username, status, last_online,
     is_banned, ban_expires_at, ban_reason, is_bot, is_deleted, created_at";

impl Storage {
    // ========================================================================
    // User Operations
    // ========================================================================

    pub async fn create_user(
        &self,
        phone: &str,
        first_name: &str,
        last_name: Option<&str>,
        now: i64,
    ) -> Result<User> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO users (access_hash, phone, first_name, last_name, status, last_online, created_at)
             VALUES (?, ?, ?, ?, 'online', ?, ?)
             RETURNING id",
        )
        .bind(crypto::generate_access_hash())
        .bind(phone)
        .bind(first_name)
        .bind(last_name)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        self.get_user(id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn create_bot(&self, phone: &str, first_name: &str, now: i64) -> Result<User> {
        let user = self.create_user(phone, first_name, None, now).await?;
        sqlx::query("UPDATE users SET is_bot = 1 WHERE id = ?")
            .bind(user.id)
            .execute(&self.pool)
            .await?;
        Ok(User { is_bot: true, ..user })
    }

    pub async fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn get_user_by_phone(&self, phone: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE phone = ?"))
            .bind(phone)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn touch_last_online(&self, user_id: i64, status: UserStatus, now: i64) -> Result<()> {
        sqlx::query("UPDATE users SET status = ?, last_online = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn ban_user(
        &self,
        user_id: i64,
        reason: Option<&str>,
        expires_at: Option<i64>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET is_banned = 1, ban_reason = ?, ban_expires_at = ? WHERE id = ? AND is_deleted = 0",
        )
        .bind(reason)
        .bind(expires_at)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn unban_user(&self, user_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET is_banned = 0, ban_reason = NULL, ban_expires_at = NULL WHERE id = ?",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn soft_delete_user(&self, user_id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE users SET is_deleted = 1 WHERE id = ? AND is_deleted = 0")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Every live, human account.
    pub async fn all_target_user_ids(&self) -> Result<Vec<i64>> {
        sqlx::query_scalar("SELECT id FROM users WHERE is_deleted = 0 AND is_bot = 0 ORDER BY id")
            .fetch_all(&self.pool)
            .await
    }

    /// Live accounts whose presence was refreshed after `since`.
    pub async fn online_user_ids(&self, since: i64) -> Result<Vec<i64>> {
        sqlx::query_scalar(
            "SELECT id FROM users WHERE is_deleted = 0 AND is_bot = 0 AND last_online > ? ORDER BY id",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
    }

    // ========================================================================
    // Session Operations
    // ========================================================================

    /// Bind a transport key to a user. Re-binding refreshes the activity stamp.
    pub async fn bind_key(&self, auth_key_id: i64, user_id: i64, now: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (auth_key_id, user_id, last_active, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (auth_key_id, user_id) DO UPDATE SET last_active = excluded.last_active",
        )
        .bind(auth_key_id)
        .bind(user_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The most recently active session for a transport key.
    pub async fn latest_session(&self, auth_key_id: i64) -> Result<Option<Session>> {
        sqlx::query_as::<_, Session>(
            "SELECT id, auth_key_id, user_id, last_active, created_at
             FROM sessions WHERE auth_key_id = ?
             ORDER BY last_active DESC, id DESC LIMIT 1",
        )
        .bind(auth_key_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn touch_session(&self, session_id: i64, now: i64) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_active = ? WHERE id = ?")
            .bind(now)
            .bind(session_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ========================================================================
    // API Credentials & Universal Codes
    // ========================================================================

    pub async fn allow_api(&self, api_id: i64, api_hash: &str, now: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO api_credentials (api_id, api_hash, created_at) VALUES (?, ?, ?)
             ON CONFLICT (api_id) DO UPDATE SET api_hash = excluded.api_hash",
        )
        .bind(api_id)
        .bind(api_hash)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn is_api_allowed(&self, api_id: i64, api_hash: &str) -> Result<bool> {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT api_hash FROM api_credentials WHERE api_id = ?")
                .bind(api_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(stored.is_some_and(|hash| crypto::constant_time_eq(&hash, api_hash)))
    }

    pub async fn add_universal_code(&self, code: &str, now: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO universal_codes (code, is_active, usage_count, created_at) VALUES (?, 1, 0, ?)
             ON CONFLICT (code) DO UPDATE SET is_active = 1",
        )
        .bind(code)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_universal_code_active(&self, code: &str, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE universal_codes SET is_active = ? WHERE code = ?")
            .bind(active)
            .bind(code)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Match an active universal code and count the use in one statement.
    pub async fn consume_universal_code(&self, code: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE universal_codes SET usage_count = usage_count + 1 WHERE code = ? AND is_active = 1",
        )
        .bind(code)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get_universal_code(&self, code: &str) -> Result<Option<UniversalCode>> {
        sqlx::query_as::<_, UniversalCode>(
            "SELECT id, code, is_active, usage_count, created_at FROM universal_codes WHERE code = ?",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_latest_session_wins() {
        let storage = Storage::in_memory().await.unwrap();
        let a = storage.create_user("+1001", "A", None, 10).await.unwrap();
        let b = storage.create_user("+1002", "B", None, 10).await.unwrap();

        storage.bind_key(77, a.id, 100).await.unwrap();
        storage.bind_key(77, b.id, 200).await.unwrap();
        assert_eq!(storage.latest_session(77).await.unwrap().unwrap().user_id, b.id);

        storage.bind_key(77, a.id, 300).await.unwrap();
        assert_eq!(storage.latest_session(77).await.unwrap().unwrap().user_id, a.id);
        assert!(storage.latest_session(78).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_universal_code_counts_each_use() {
        let storage = Storage::in_memory().await.unwrap();
        storage.add_universal_code("000000", 1).await.unwrap();

        assert!(storage.consume_universal_code("000000").await.unwrap());
        assert!(!storage.consume_universal_code("111111").await.unwrap());
        assert_eq!(storage.get_universal_code("000000").await.unwrap().unwrap().usage_count, 1);

        storage.set_universal_code_active("000000", false).await.unwrap();
        assert!(!storage.consume_universal_code("000000").await.unwrap());
        assert_eq!(storage.get_universal_code("000000").await.unwrap().unwrap().usage_count, 1);
    }

    #[tokio::test]
    async fn test_target_queries_skip_bots_and_deleted() {
        let storage = Storage::in_memory().await.unwrap();
        let a = storage.create_user("+1", "A", None, 1000).await.unwrap();
        let b = storage.create_user("+2", "B", None, 1000).await.unwrap();
        storage.create_bot("+3", "Bot", 1000).await.unwrap();
        storage.soft_delete_user(b.id).await.unwrap();

        assert_eq!(storage.all_target_user_ids().await.unwrap(), vec![a.id]);
        assert_eq!(storage.online_user_ids(999).await.unwrap(), vec![a.id]);
        assert!(storage.online_user_ids(1000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_api_allow_list() {
        let storage = Storage::in_memory().await.unwrap();
        storage.allow_api(1, "X", 0).await.unwrap();
        assert!(storage.is_api_allowed(1, "X").await.unwrap());
        assert!(!storage.is_api_allowed(1, "Y").await.unwrap());
        assert!(!storage.is_api_allowed(2, "X").await.unwrap());
    }
}
