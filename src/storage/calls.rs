use sqlx::Result;

use super::Storage;
use crate::crypto;
use crate::models::*;

const CALL_COLUMNS: &str = "id, access_hash, caller_id, callee_id, is_video, g_a_hash, g_b, key_fingerprint,
     confirmed_fingerprint, protocol, state, duration, created_at, updated_at";

/// Column writes that accompany a state change. `None` leaves the column as is.
#[derive(Debug, Default, Clone)]
pub struct CallChanges {
    pub g_b: Option<Vec<u8>>,
    pub key_fingerprint: Option<i64>,
    pub confirmed_fingerprint: Option<i64>,
    pub duration: Option<i64>,
}

impl Storage {
    // ========================================================================
    // Call Operations
    // ========================================================================

    /// Insert a pending call. A second open call for the same pair violates
    /// `idx_calls_open_pair` and surfaces as a unique-constraint error.
    pub async fn create_call(
        &self,
        caller_id: i64,
        callee_id: i64,
        is_video: bool,
        g_a_hash: &[u8],
        protocol: Option<&str>,
        now: i64,
    ) -> Result<Call> {
        sqlx::query_as::<_, Call>(&format!(
            "INSERT INTO calls (access_hash, caller_id, callee_id, is_video, g_a_hash, protocol, state, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {CALL_COLUMNS}"
        ))
        .bind(crypto::generate_access_hash())
        .bind(caller_id)
        .bind(callee_id)
        .bind(is_video)
        .bind(g_a_hash)
        .bind(protocol)
        .bind(CallState::Pending.as_str())
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_call(&self, call_id: i64) -> Result<Option<Call>> {
        sqlx::query_as::<_, Call>(&format!("SELECT {CALL_COLUMNS} FROM calls WHERE id = ?"))
            .bind(call_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// The open call between two users, in either direction.
    pub async fn open_call_between(&self, a: i64, b: i64) -> Result<Option<Call>> {
        sqlx::query_as::<_, Call>(&format!(
            "SELECT {CALL_COLUMNS} FROM calls
             WHERE ((caller_id = ? AND callee_id = ?) OR (caller_id = ? AND callee_id = ?))
               AND state IN ('pending', 'ringing', 'accepted')
             LIMIT 1"
        ))
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .fetch_optional(&self.pool)
        .await
    }

    /// Compare-and-set on the call state. Returns the updated row, or `None`
    /// when the call was no longer in `from`.
    pub async fn transition_call(
        &self,
        call_id: i64,
        from: CallState,
        to: CallState,
        changes: &CallChanges,
        now: i64,
    ) -> Result<Option<Call>> {
        sqlx::query_as::<_, Call>(&format!(
            "UPDATE calls SET
                state = ?,
                g_b = COALESCE(?, g_b),
                key_fingerprint = COALESCE(?, key_fingerprint),
                confirmed_fingerprint = COALESCE(?, confirmed_fingerprint),
                duration = COALESCE(?, duration),
                updated_at = ?
             WHERE id = ? AND state = ?
             RETURNING {CALL_COLUMNS}"
        ))
        .bind(to.as_str())
        .bind(changes.g_b.as_deref())
        .bind(changes.key_fingerprint)
        .bind(changes.confirmed_fingerprint)
        .bind(changes.duration)
        .bind(now)
        .bind(call_id)
        .bind(from.as_str())
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn count_open_calls(&self) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM calls WHERE state IN ('pending', 'ringing', 'accepted')",
        )
        .fetch_one(&self.pool)
        .await
    }
}
