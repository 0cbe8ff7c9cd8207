use sqlx::Result;

use super::Storage;
use crate::models::Message;

const MESSAGE_COLUMNS: &str = "id, from_id, peer_id, message, date, edit_date, is_deleted";

impl Storage {
    // ========================================================================
    // Message Operations
    // ========================================================================

    pub async fn create_message(&self, from_id: i64, peer_id: i64, text: &str, now: i64) -> Result<Message> {
        sqlx::query_as::<_, Message>(&format!(
            "INSERT INTO messages (from_id, peer_id, message, date) VALUES (?, ?, ?, ?)
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(from_id)
        .bind(peer_id)
        .bind(text)
        .bind(now)
        .fetch_one(&self.pool)
        .await
    }

    /// Only the author may edit; returns the edited row.
    pub async fn edit_message(&self, id: i64, from_id: i64, text: &str, now: i64) -> Result<Option<Message>> {
        sqlx::query_as::<_, Message>(&format!(
            "UPDATE messages SET message = ?, edit_date = ?
             WHERE id = ? AND from_id = ? AND is_deleted = 0
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(text)
        .bind(now)
        .bind(id)
        .bind(from_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Soft-delete messages the user sent or received. Returns the affected rows.
    pub async fn delete_messages(&self, ids: &[i64], user_id: i64) -> Result<Vec<Message>> {
        let mut deleted = Vec::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query_as::<_, Message>(&format!(
                "UPDATE messages SET is_deleted = 1
                 WHERE id = ? AND (from_id = ? OR peer_id = ?) AND is_deleted = 0
                 RETURNING {MESSAGE_COLUMNS}"
            ))
            .bind(id)
            .bind(user_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

            deleted.extend(row);
        }

        Ok(deleted)
    }
}
