//! Per-user update log.
//!
//! Every state change a user must learn about is appended here with the next
//! `pts` for that user. Appends are also pushed to the user's open sockets;
//! `difference` is the authoritative way to catch up.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::hub::Hub;
use crate::models::*;
use crate::storage::Storage;

/// User client sockets, keyed by user id.
pub type ClientHub = Hub<i64>;

#[derive(Clone)]
pub struct UpdateLog {
    storage: Arc<Storage>,
    hub: ClientHub,
    difference_limit: i64,
}

impl UpdateLog {
    pub fn new(storage: Arc<Storage>, hub: ClientHub, difference_limit: i64) -> Self {
        Self {
            storage,
            hub,
            difference_limit: difference_limit.max(1),
        }
    }

    pub fn hub(&self) -> &ClientHub {
        &self.hub
    }

    /// Persist an update under the next pts and push it to the user's sockets.
    pub async fn append_update(&self, user_id: i64, kind: UpdateType, payload: &Value) -> Result<i64> {
        let now = unix_now();
        let pts = self
            .storage
            .append_update(user_id, kind.as_str(), &payload.to_string(), now)
            .await?;

        tracing::debug!(user_id = user_id, pts = pts, kind = kind.as_str(), "Update appended");
        self.push(user_id, kind, pts, now, payload);

        Ok(pts)
    }

    fn push(&self, user_id: i64, kind: UpdateType, pts: i64, now: i64, payload: &Value) {
        let envelope = WsEnvelope {
            kind: "update".to_string(),
            category: Some(kind.as_str().to_string()),
            title: None,
            message: None,
            data: json!({ "pts": pts, "update": payload }),
            priority: None,
            sound: false,
            link: None,
            timestamp: now,
        };

        match serde_json::to_string(&envelope) {
            Ok(text) => {
                self.hub.send_to(user_id, Arc::from(text));
            }
            Err(e) => tracing::warn!(user_id = user_id, "Failed to encode update: {}", e),
        }
    }

    pub async fn current_state(&self, user_id: i64) -> Result<UpdateState> {
        Ok(self.storage.ensure_update_state(user_id, unix_now()).await?)
    }

    /// What the client is missing since `client_pts`.
    ///
    /// A client behind the retained window gets `differenceTooLong` and is
    /// expected to refetch its state from scratch.
    pub async fn difference(
        &self,
        user_id: i64,
        client_pts: i64,
        _client_qts: i64,
        _client_date: i64,
    ) -> Result<Difference> {
        let state = self.current_state(user_id).await?;
        let client_pts = client_pts.max(1);

        if client_pts >= state.pts {
            return Ok(Difference::Empty {
                date: state.date,
                seq: state.seq,
            });
        }

        let records = self
            .storage
            .updates_after(user_id, client_pts, self.difference_limit)
            .await?;

        let Some(first) = records.first() else {
            return Ok(Difference::TooLong { pts: state.pts });
        };
        if first.pts != client_pts + 1 {
            tracing::debug!(user_id = user_id, client_pts = client_pts, oldest = first.pts, "Client fell behind retention");
            return Ok(Difference::TooLong { pts: state.pts });
        }

        let last = records.last().map(|r| (r.pts, r.date));
        let is_slice = records.len() as i64 == self.difference_limit
            && last.is_some_and(|(pts, _)| pts < state.pts);

        let mut new_messages = Vec::new();
        let mut other_updates = Vec::new();
        for record in records {
            if UpdateType::is_message(&record.update_type) {
                new_messages.push(record.payload_value());
            } else {
                other_updates.push(OtherUpdate {
                    data: record.payload_value(),
                    kind: record.update_type,
                    pts: record.pts,
                    date: record.date,
                });
            }
        }

        match last {
            Some((pts, date)) if is_slice => Ok(Difference::Slice {
                new_messages,
                other_updates,
                intermediate_state: UpdateState { pts, date, ..state }.into(),
            }),
            _ => Ok(Difference::Full {
                new_messages,
                other_updates,
                state: state.into(),
            }),
        }
    }

    /// Drop records older than `retention`. Returns how many were removed.
    pub async fn sweep(&self, retention: Duration) -> Result<u64> {
        let cutoff = unix_now() - retention.as_secs() as i64;
        let removed = self.storage.delete_updates_before(cutoff).await?;
        if removed > 0 {
            tracing::info!(removed = removed, "Expired update records removed");
        }
        Ok(removed)
    }
}
