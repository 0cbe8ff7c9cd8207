use sqlx::Result;

use super::Storage;
use crate::models::*;

impl Storage {
    // ========================================================================
    // Update State Operations
    // ========================================================================

    /// Current state for a user, created as `(1, 0, 1, now, 0)` on first use.
    pub async fn ensure_update_state(&self, user_id: i64, now: i64) -> Result<UpdateState> {
        sqlx::query(
            "INSERT OR IGNORE INTO update_states (user_id, pts, qts, seq, date, unread_count)
             VALUES (?, 1, 0, 1, ?, 0)",
        )
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        sqlx::query_as::<_, UpdateState>(
            "SELECT pts, qts, seq, date, unread_count FROM update_states WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
    }

    /// Allocate the next pts and persist the record in one transaction, so
    /// the stored sequence and the state never disagree.
    pub async fn append_update(
        &self,
        user_id: i64,
        update_type: &str,
        payload: &str,
        now: i64,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT OR IGNORE INTO update_states (user_id, pts, qts, seq, date, unread_count)
             VALUES (?, 1, 0, 1, ?, 0)",
        )
        .bind(user_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let pts: i64 = sqlx::query_scalar(
            "UPDATE update_states SET pts = pts + 1, date = MAX(date, ?)
             WHERE user_id = ?
             RETURNING pts",
        )
        .bind(now)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO updates (user_id, pts, update_type, payload, date) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(pts)
        .bind(update_type)
        .bind(payload)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(pts)
    }

    pub async fn adjust_unread(&self, user_id: i64, delta: i64) -> Result<()> {
        sqlx::query(
            "UPDATE update_states SET unread_count = MAX(unread_count + ?, 0) WHERE user_id = ?",
        )
        .bind(delta)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn reset_unread(&self, user_id: i64) -> Result<()> {
        sqlx::query("UPDATE update_states SET unread_count = 0 WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ========================================================================
    // Update Record Operations
    // ========================================================================

    /// Up to `limit` records with `pts > after`, ascending.
    pub async fn updates_after(&self, user_id: i64, after: i64, limit: i64) -> Result<Vec<UpdateRecord>> {
        sqlx::query_as::<_, UpdateRecord>(
            "SELECT id, user_id, pts, update_type, payload, date
             FROM updates WHERE user_id = ? AND pts > ?
             ORDER BY pts ASC LIMIT ?",
        )
        .bind(user_id)
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn max_update_pts(&self, user_id: i64) -> Result<Option<i64>> {
        sqlx::query_scalar("SELECT MAX(pts) FROM updates WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
    }

    /// Drop records written before `cutoff` (Unix seconds).
    pub async fn delete_updates_before(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM updates WHERE date < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
