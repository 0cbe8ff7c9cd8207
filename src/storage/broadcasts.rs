use sqlx::Result;

use super::Storage;
use crate::models::*;

const BROADCAST_COLUMNS: &str = "id, admin_id, title, message, target_type, target_ids, status, total, success,
     failed, scheduled_at, created_at, started_at, completed_at";

const DETAIL_COLUMNS: &str = "id, broadcast_id, user_id, status, error, attempts, updated_at";

impl Storage {
    // ========================================================================
    // Broadcast Operations
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    pub async fn create_broadcast(
        &self,
        admin_id: i64,
        title: &str,
        message: &str,
        target_type: &str,
        target_ids: &[i64],
        status: BroadcastStatus,
        total: i64,
        scheduled_at: Option<i64>,
        now: i64,
    ) -> Result<Broadcast> {
        let started_at = (status == BroadcastStatus::Sending).then_some(now);
        let target_ids = serde_json::to_string(target_ids).unwrap_or_else(|_| "[]".to_string());

        sqlx::query_as::<_, Broadcast>(&format!(
            "INSERT INTO broadcasts
             (admin_id, title, message, target_type, target_ids, status, total, scheduled_at, created_at, started_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {BROADCAST_COLUMNS}"
        ))
        .bind(admin_id)
        .bind(title)
        .bind(message)
        .bind(target_type)
        .bind(target_ids)
        .bind(status.as_str())
        .bind(total)
        .bind(scheduled_at)
        .bind(now)
        .bind(started_at)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_broadcast(&self, id: i64) -> Result<Option<Broadcast>> {
        sqlx::query_as::<_, Broadcast>(&format!("SELECT {BROADCAST_COLUMNS} FROM broadcasts WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_broadcasts(&self, limit: i64, offset: i64) -> Result<Vec<Broadcast>> {
        sqlx::query_as::<_, Broadcast>(&format!(
            "SELECT {BROADCAST_COLUMNS} FROM broadcasts ORDER BY id DESC LIMIT ? OFFSET ?"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
    }

    /// Pending broadcasts whose schedule has come due.
    pub async fn due_broadcasts(&self, now: i64) -> Result<Vec<Broadcast>> {
        sqlx::query_as::<_, Broadcast>(&format!(
            "SELECT {BROADCAST_COLUMNS} FROM broadcasts
             WHERE status = 'pending' AND (scheduled_at IS NULL OR scheduled_at <= ?)
             ORDER BY id"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
    }

    /// Move a broadcast into `sending`. Only one caller wins a given `from` state.
    pub async fn claim_broadcast(
        &self,
        id: i64,
        from: BroadcastStatus,
        total: i64,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE broadcasts SET status = 'sending', total = ?, started_at = COALESCE(started_at, ?), completed_at = NULL
             WHERE id = ? AND status = ?",
        )
        .bind(total)
        .bind(now)
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn finish_broadcast(
        &self,
        id: i64,
        status: BroadcastStatus,
        success: i64,
        failed: i64,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE broadcasts SET status = ?, total = ?, success = ?, failed = ?, completed_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(success + failed)
        .bind(success)
        .bind(failed)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn count_broadcasts_with_status(&self, status: BroadcastStatus) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM broadcasts WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
    }

    // ========================================================================
    // Broadcast Detail Operations
    // ========================================================================

    /// Record one delivery attempt. A repeat attempt for the same recipient
    /// overwrites the outcome and bumps the attempt counter.
    pub async fn record_broadcast_detail(
        &self,
        broadcast_id: i64,
        user_id: i64,
        status: &str,
        error: Option<&str>,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO broadcast_details (broadcast_id, user_id, status, error, attempts, updated_at)
             VALUES (?, ?, ?, ?, 1, ?)
             ON CONFLICT (broadcast_id, user_id) DO UPDATE SET
                status = excluded.status,
                error = excluded.error,
                attempts = attempts + 1,
                updated_at = excluded.updated_at",
        )
        .bind(broadcast_id)
        .bind(user_id)
        .bind(status)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_broadcast_details(&self, broadcast_id: i64) -> Result<Vec<BroadcastDetail>> {
        sqlx::query_as::<_, BroadcastDetail>(&format!(
            "SELECT {DETAIL_COLUMNS} FROM broadcast_details WHERE broadcast_id = ? ORDER BY user_id"
        ))
        .bind(broadcast_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn failed_broadcast_recipients(&self, broadcast_id: i64) -> Result<Vec<i64>> {
        sqlx::query_scalar(
            "SELECT user_id FROM broadcast_details WHERE broadcast_id = ? AND status = ? ORDER BY user_id",
        )
        .bind(broadcast_id)
        .bind(DETAIL_FAILED)
        .fetch_all(&self.pool)
        .await
    }

    /// `(success, failed)` over the detail rows.
    pub async fn broadcast_detail_counts(&self, broadcast_id: i64) -> Result<(i64, i64)> {
        sqlx::query_as(
            "SELECT
                COALESCE(SUM(CASE WHEN status = ? THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = ? THEN 1 ELSE 0 END), 0)
             FROM broadcast_details WHERE broadcast_id = ?",
        )
        .bind(DETAIL_SUCCESS)
        .bind(DETAIL_FAILED)
        .bind(broadcast_id)
        .fetch_one(&self.pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_detail_upsert_counts_attempts() {
        let storage = Storage::in_memory().await.unwrap();
        let b = storage
            .create_broadcast(1, "t", "hi", "custom", &[5, 6], BroadcastStatus::Sending, 2, None, 10)
            .await
            .unwrap();
        assert_eq!(b.target_id_list(), vec![5, 6]);
        assert_eq!(b.started_at, Some(10));

        storage.record_broadcast_detail(b.id, 5, DETAIL_SUCCESS, None, 11).await.unwrap();
        storage.record_broadcast_detail(b.id, 6, DETAIL_FAILED, Some("boom"), 11).await.unwrap();
        assert_eq!(storage.broadcast_detail_counts(b.id).await.unwrap(), (1, 1));
        assert_eq!(storage.failed_broadcast_recipients(b.id).await.unwrap(), vec![6]);

        storage.record_broadcast_detail(b.id, 6, DETAIL_SUCCESS, None, 12).await.unwrap();
        assert_eq!(storage.broadcast_detail_counts(b.id).await.unwrap(), (2, 0));

        let details = storage.list_broadcast_details(b.id).await.unwrap();
        assert_eq!(details.len(), 2);
        assert_eq!(details[1].attempts, 2);
        assert_eq!(details[1].error, None);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let storage = Storage::in_memory().await.unwrap();
        let b = storage
            .create_broadcast(1, "", "hi", "all", &[], BroadcastStatus::Pending, 0, Some(50), 10)
            .await
            .unwrap();

        assert!(storage.due_broadcasts(49).await.unwrap().is_empty());
        assert_eq!(storage.due_broadcasts(50).await.unwrap().len(), 1);

        assert!(storage.claim_broadcast(b.id, BroadcastStatus::Pending, 3, 50).await.unwrap());
        assert!(!storage.claim_broadcast(b.id, BroadcastStatus::Pending, 3, 50).await.unwrap());
        assert!(storage.due_broadcasts(60).await.unwrap().is_empty());
    }
}
