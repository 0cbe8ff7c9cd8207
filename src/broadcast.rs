//! Admin broadcasts.
//!
//! `send` records the broadcast, expands its target selector and returns at
//! once; delivery runs on a detached task that writes one detail row per
//! recipient and settles the broadcast's counters from those rows. Broadcasts
//! scheduled for later stay `pending` until [`BroadcastDispatcher::dispatch_due`]
//! picks them up.

use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

use crate::{
    error::{AppError, Result},
    models::*,
    notify::{AdminEvent, Notifier},
    storage::Storage,
    updates::UpdateLog,
};

/// Delivers one broadcast to one recipient.
#[axum::async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, broadcast: &Broadcast, user_id: i64) -> std::result::Result<(), String>;
}

/// Broadcasts arrive as service messages in the recipient's update stream.
#[axum::async_trait]
impl Delivery for UpdateLog {
    async fn deliver(&self, broadcast: &Broadcast, user_id: i64) -> std::result::Result<(), String> {
        let payload = json!({
            "_": "message",
            "id": 0,
            "from_id": 0,
            "peer_id": user_id,
            "message": broadcast.message,
            "title": broadcast.title,
            "date": unix_now(),
            "broadcast_id": broadcast.id,
        });

        self.append_update(user_id, UpdateType::NewMessage, &payload)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[derive(Clone)]
pub struct BroadcastDispatcher {
    storage: Arc<Storage>,
    delivery: Arc<dyn Delivery>,
    notifier: Notifier,
    presence_window: i64,
}

impl BroadcastDispatcher {
    pub fn new(storage: Arc<Storage>, delivery: Arc<dyn Delivery>, notifier: Notifier, presence_window: i64) -> Self {
        Self {
            storage,
            delivery,
            notifier,
            presence_window,
        }
    }

    pub async fn send(&self, admin_id: i64, req: &SendBroadcastRequest) -> Result<SendBroadcastResponse> {
        let message = req.message.trim();
        if message.is_empty() {
            return Err(AppError::InvalidArgument("message is required".into()));
        }

        let selector = TargetSelector::parse(&req.target_type, &req.target_ids);
        if matches!(&selector, TargetSelector::Custom(ids) if ids.is_empty()) {
            return Err(AppError::InvalidArgument("target_ids is required for custom broadcasts".into()));
        }

        let now = unix_now();
        let scheduled_at = req.scheduled_at.filter(|at| *at > now);
        let status = if scheduled_at.is_some() {
            BroadcastStatus::Pending
        } else {
            BroadcastStatus::Sending
        };

        let targets = self.expand(&selector, now).await?;
        let broadcast = self
            .storage
            .create_broadcast(
                admin_id,
                req.title.trim(),
                message,
                &req.target_type,
                &req.target_ids,
                status,
                targets.len() as i64,
                scheduled_at,
                now,
            )
            .await?;

        tracing::info!(
            broadcast_id = broadcast.id,
            admin_id = admin_id,
            target_type = %req.target_type,
            targets = targets.len(),
            scheduled = scheduled_at.is_some(),
            "Broadcast created"
        );

        let response = SendBroadcastResponse {
            id: broadcast.id,
            total_users: targets.len() as i64,
        };
        if status == BroadcastStatus::Sending {
            self.spawn(broadcast, targets);
        }

        Ok(response)
    }

    /// Resolve a selector to recipient ids.
    pub async fn expand(&self, selector: &TargetSelector, now: i64) -> Result<Vec<i64>> {
        let ids = match selector {
            TargetSelector::All => self.storage.all_target_user_ids().await?,
            TargetSelector::Online => {
                self.storage
                    .online_user_ids(now - self.presence_window)
                    .await?
            }
            TargetSelector::Custom(ids) => {
                let mut seen = HashSet::new();
                ids.iter().copied().filter(|id| seen.insert(*id)).collect()
            }
        };
        Ok(ids)
    }

    /// Re-deliver to every recipient whose last attempt failed.
    pub async fn retry(&self, broadcast_id: i64) -> Result<usize> {
        let broadcast = self.load(broadcast_id).await?;
        let status = match broadcast.status.as_str() {
            "failed" => BroadcastStatus::Failed,
            "partial_failed" => BroadcastStatus::PartialFailed,
            other => {
                return Err(AppError::Conflict(format!("cannot retry a {} broadcast", other)));
            }
        };

        let recipients = self.storage.failed_broadcast_recipients(broadcast_id).await?;
        if recipients.is_empty() {
            return Err(AppError::Conflict("no failed deliveries to retry".into()));
        }

        if !self
            .storage
            .claim_broadcast(broadcast_id, status, broadcast.total, unix_now())
            .await?
        {
            return Err(AppError::Conflict("broadcast is already being delivered".into()));
        }

        tracing::info!(broadcast_id = broadcast_id, recipients = recipients.len(), "Retrying broadcast");
        let queued = recipients.len();
        self.spawn(broadcast, recipients);

        Ok(queued)
    }

    /// Start every scheduled broadcast that has come due.
    pub async fn dispatch_due(&self) -> Result<usize> {
        let now = unix_now();
        let mut started = 0;

        for broadcast in self.storage.due_broadcasts(now).await? {
            let targets = self.expand(&broadcast.selector(), now).await?;
            if self
                .storage
                .claim_broadcast(broadcast.id, BroadcastStatus::Pending, targets.len() as i64, now)
                .await?
            {
                self.spawn(broadcast, targets);
                started += 1;
            }
        }

        if started > 0 {
            tracing::info!(started = started, "Scheduled broadcasts started");
        }
        Ok(started)
    }

    pub async fn get(&self, broadcast_id: i64) -> Result<BroadcastWithDetails> {
        let broadcast = self.load(broadcast_id).await?;
        let details = self.storage.list_broadcast_details(broadcast_id).await?;
        Ok(BroadcastWithDetails { broadcast, details })
    }

    pub async fn list(&self, page: &PageQuery) -> Result<Vec<Broadcast>> {
        Ok(self
            .storage
            .list_broadcasts(page.limit.clamp(1, 200), page.offset.max(0))
            .await?)
    }

    async fn load(&self, broadcast_id: i64) -> Result<Broadcast> {
        self.storage
            .get_broadcast(broadcast_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("broadcast {}", broadcast_id)))
    }

    fn spawn(&self, broadcast: Broadcast, recipients: Vec<i64>) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let broadcast_id = broadcast.id;
            if let Err(e) = dispatcher.run(&broadcast, &recipients).await {
                // the row stays in `sending`; an operator can inspect the details
                tracing::error!(broadcast_id = broadcast_id, "Broadcast delivery aborted: {}", e);
                dispatcher
                    .notifier
                    .publish(AdminEvent::system_error(&format!("broadcast {}", broadcast_id), &e));
            }
        });
    }

    async fn run(&self, broadcast: &Broadcast, recipients: &[i64]) -> Result<BroadcastStatus> {
        for &user_id in recipients {
            let outcome = match self.storage.get_user(user_id).await? {
                Some(user) if !user.is_deleted => self.delivery.deliver(broadcast, user_id).await,
                _ => Err("user not found".to_string()),
            };

            let now = unix_now();
            match outcome {
                Ok(()) => {
                    self.storage
                        .record_broadcast_detail(broadcast.id, user_id, DETAIL_SUCCESS, None, now)
                        .await?
                }
                Err(error) => {
                    tracing::debug!(broadcast_id = broadcast.id, user_id = user_id, "Delivery failed: {}", error);
                    self.storage
                        .record_broadcast_detail(broadcast.id, user_id, DETAIL_FAILED, Some(&error), now)
                        .await?
                }
            }
        }

        let (success, failed) = self.storage.broadcast_detail_counts(broadcast.id).await?;
        let status = BroadcastStatus::from_counts(success, failed);
        self.storage
            .finish_broadcast(broadcast.id, status, success, failed, unix_now())
            .await?;

        tracing::info!(
            broadcast_id = broadcast.id,
            status = status.as_str(),
            success = success,
            failed = failed,
            "Broadcast finished"
        );
        self.notifier.send_to(
            broadcast.admin_id,
            AdminEvent::broadcast_finished(broadcast.id, status, success, failed),
        );

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::AdminHub;
    use crate::updates::ClientHub;
    use parking_lot::Mutex;

    /// Fails each listed recipient once, then succeeds.
    #[derive(Default)]
    struct FlakyDelivery {
        fail_once: Mutex<HashSet<i64>>,
    }

    #[axum::async_trait]
    impl Delivery for FlakyDelivery {
        async fn deliver(&self, _broadcast: &Broadcast, user_id: i64) -> std::result::Result<(), String> {
            if self.fail_once.lock().remove(&user_id) {
                Err("gateway timeout".to_string())
            } else {
                Ok(())
            }
        }
    }

    async fn storage_with_users(n: usize) -> (Arc<Storage>, Vec<i64>) {
        let storage = Arc::new(Storage::in_memory().await.unwrap());
        let mut ids = Vec::new();
        for i in 0..n {
            ids.push(storage.create_user(&format!("+100{}", i), "U", None, unix_now()).await.unwrap().id);
        }
        (storage, ids)
    }

    fn request(target_type: &str, target_ids: Vec<i64>) -> SendBroadcastRequest {
        SendBroadcastRequest {
            title: "Notice".into(),
            message: "Maintenance tonight".into(),
            target_type: target_type.into(),
            target_ids,
            scheduled_at: None,
        }
    }

    async fn wait_terminal(storage: &Storage, id: i64) -> Broadcast {
        for _ in 0..200 {
            let b = storage.get_broadcast(id).await.unwrap().unwrap();
            if b.status != "sending" && b.status != "pending" {
                return b;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("broadcast {} never finished", id);
    }

    #[tokio::test]
    async fn test_broadcast_to_all_completes() {
        let (storage, _) = storage_with_users(5).await;
        storage.create_bot("+999", "bot", 0).await.unwrap();
        let hub = AdminHub::new("admin", 64);
        let mut admin = hub.register(1).await.unwrap();
        let notifier = Notifier::new(Arc::clone(&storage), hub);
        let updates = UpdateLog::new(Arc::clone(&storage), ClientHub::new("clients", 64), 100);
        let dispatcher = BroadcastDispatcher::new(Arc::clone(&storage), Arc::new(updates.clone()), notifier, 300);

        let response = dispatcher.send(1, &request("all", vec![])).await.unwrap();
        assert_eq!(response.total_users, 5);

        let finished = wait_terminal(&storage, response.id).await;
        assert_eq!(finished.status, "completed");
        assert_eq!((finished.total, finished.success, finished.failed), (5, 5, 0));

        let details = storage.list_broadcast_details(response.id).await.unwrap();
        assert_eq!(details.len(), 5);
        assert!(details.iter().all(|d| d.status == DETAIL_SUCCESS));

        // each recipient got the message in its update log
        let first = details[0].user_id;
        assert_eq!(updates.current_state(first).await.unwrap().pts, 2);

        let frame = admin.rx.recv().await.unwrap();
        let envelope: WsEnvelope = serde_json::from_str(&frame).unwrap();
        assert_eq!(envelope.category.as_deref(), Some("broadcast_complete"));
        assert_eq!(envelope.data["total"], 5);
        assert_eq!(envelope.data["success"], 5);
        assert_eq!(envelope.data["failed"], 0);
    }

    #[tokio::test]
    async fn test_retry_redelivers_failed_recipients() {
        let (storage, ids) = storage_with_users(3).await;
        let notifier = Notifier::new(Arc::clone(&storage), AdminHub::new("admin", 64));
        let delivery = FlakyDelivery::default();
        delivery.fail_once.lock().insert(ids[1]);
        let dispatcher = BroadcastDispatcher::new(Arc::clone(&storage), Arc::new(delivery), notifier, 300);

        // an unknown id fails for good
        let response = dispatcher
            .send(1, &request("custom", vec![ids[0], ids[1], ids[1], 4242]))
            .await
            .unwrap();
        assert_eq!(response.total_users, 3);

        let first = wait_terminal(&storage, response.id).await;
        assert_eq!(first.status, "partial_failed");
        assert_eq!((first.total, first.success, first.failed), (3, 1, 2));

        assert_eq!(dispatcher.retry(response.id).await.unwrap(), 2);
        let second = wait_terminal(&storage, response.id).await;
        assert_eq!(second.status, "partial_failed");
        assert_eq!((second.total, second.success, second.failed), (3, 2, 1));
        assert_eq!(second.total, second.success + second.failed);

        let retried = dispatcher.get(response.id).await.unwrap();
        let row = retried.details.iter().find(|d| d.user_id == ids[1]).unwrap();
        assert_eq!(row.status, DETAIL_SUCCESS);
        assert_eq!(row.attempts, 2);
    }

    #[tokio::test]
    async fn test_completed_broadcast_cannot_be_retried() {
        let (storage, ids) = storage_with_users(1).await;
        let notifier = Notifier::new(Arc::clone(&storage), AdminHub::new("admin", 64));
        let dispatcher =
            BroadcastDispatcher::new(Arc::clone(&storage), Arc::new(FlakyDelivery::default()), notifier, 300);

        let response = dispatcher.send(1, &request("custom", ids)).await.unwrap();
        wait_terminal(&storage, response.id).await;
        assert!(matches!(dispatcher.retry(response.id).await, Err(AppError::Conflict(_))));
        assert!(matches!(dispatcher.retry(999).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_scheduled_broadcast_waits_for_sweep() {
        let (storage, _) = storage_with_users(2).await;
        let notifier = Notifier::new(Arc::clone(&storage), AdminHub::new("admin", 64));
        let dispatcher =
            BroadcastDispatcher::new(Arc::clone(&storage), Arc::new(FlakyDelivery::default()), notifier, 300);

        let mut req = request("unknown-selector", vec![]);
        req.scheduled_at = Some(unix_now() + 2);
        let response = dispatcher.send(1, &req).await.unwrap();
        assert_eq!(response.total_users, 2);
        assert_eq!(dispatcher.dispatch_due().await.unwrap(), 0);
        assert_eq!(storage.get_broadcast(response.id).await.unwrap().unwrap().status, "pending");

        tokio::time::sleep(std::time::Duration::from_millis(3100)).await;
        assert_eq!(dispatcher.dispatch_due().await.unwrap(), 1);
        assert_eq!(dispatcher.dispatch_due().await.unwrap(), 0);
        assert_eq!(wait_terminal(&storage, response.id).await.status, "completed");
    }

    #[tokio::test]
    async fn test_online_selector_uses_presence_window() {
        let (storage, ids) = storage_with_users(3).await;
        storage.touch_last_online(ids[0], UserStatus::Offline, unix_now() - 3600).await.unwrap();
        let notifier = Notifier::new(Arc::clone(&storage), AdminHub::new("admin", 64));
        let dispatcher =
            BroadcastDispatcher::new(Arc::clone(&storage), Arc::new(FlakyDelivery::default()), notifier, 300);

        let online = dispatcher.expand(&TargetSelector::Online, unix_now()).await.unwrap();
        assert_eq!(online, vec![ids[1], ids[2]]);
    }

    #[tokio::test]
    async fn test_custom_without_targets_is_rejected() {
        let (storage, _) = storage_with_users(0).await;
        let notifier = Notifier::new(Arc::clone(&storage), AdminHub::new("admin", 64));
        let dispatcher =
            BroadcastDispatcher::new(Arc::clone(&storage), Arc::new(FlakyDelivery::default()), notifier, 300);

        assert!(matches!(
            dispatcher.send(1, &request("custom", vec![])).await,
            Err(AppError::InvalidArgument(_))
        ));
    }
}
