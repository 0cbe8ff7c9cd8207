//! Admin notifications: category-tagged events persisted and pushed to
//! every connected admin console.

use serde_json::{json, Value};
use std::sync::Arc;

use crate::hub::{Frame, Hub};
use crate::models::*;
use crate::storage::Storage;

/// Admin console sockets, keyed by admin id.
pub type AdminHub = Hub<i64>;

#[derive(Debug, Clone, PartialEq)]
pub struct AdminEvent {
    pub category: NotificationCategory,
    pub priority: Priority,
    pub title: String,
    pub message: String,
    pub data: Value,
    pub sound: bool,
    pub link: Option<String>,
}

fn default_priority(category: NotificationCategory) -> Priority {
    match category {
        NotificationCategory::ServiceDown => Priority::Urgent,
        NotificationCategory::SystemError | NotificationCategory::BroadcastFailed => Priority::High,
        NotificationCategory::CallStart | NotificationCategory::CallEnd => Priority::Low,
        _ => Priority::Normal,
    }
}

impl AdminEvent {
    pub fn new(category: NotificationCategory, title: impl Into<String>, message: impl Into<String>) -> Self {
        let priority = default_priority(category);
        Self {
            category,
            priority,
            title: title.into(),
            message: message.into(),
            data: Value::Null,
            sound: matches!(priority, Priority::High | Priority::Urgent),
            link: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn user_registered(user: &User) -> Self {
        Self::new(
            NotificationCategory::UserRegister,
            "New user",
            format!("User {} ({}) registered", user.id, user.phone),
        )
        .with_data(json!({ "user_id": user.id, "phone": user.phone }))
        .with_link(format!("/users/{}", user.id))
    }

    pub fn user_logged_in(user: &User) -> Self {
        Self::new(
            NotificationCategory::UserLogin,
            "User login",
            format!("User {} signed in", user.id),
        )
        .with_data(json!({ "user_id": user.id }))
    }

    pub fn call_started(call: &Call) -> Self {
        let kind = if call.is_video { "Video" } else { "Voice" };
        Self::new(
            NotificationCategory::CallStart,
            format!("{} call", kind),
            format!("User {} is calling user {}", call.caller_id, call.callee_id),
        )
        .with_data(json!({
            "call_id": call.id,
            "caller_id": call.caller_id,
            "callee_id": call.callee_id,
            "video": call.is_video,
        }))
    }

    pub fn call_ended(call: &Call) -> Self {
        Self::new(
            NotificationCategory::CallEnd,
            "Call ended",
            format!(
                "Call {} between {} and {} finished as {} after {}s",
                call.id, call.caller_id, call.callee_id, call.state, call.duration
            ),
        )
        .with_data(json!({
            "call_id": call.id,
            "state": call.state,
            "duration": call.duration,
        }))
    }

    pub fn broadcast_finished(broadcast_id: i64, status: BroadcastStatus, success: i64, failed: i64) -> Self {
        let total = success + failed;
        let category = if status == BroadcastStatus::Completed {
            NotificationCategory::BroadcastComplete
        } else {
            NotificationCategory::BroadcastFailed
        };
        Self::new(
            category,
            "Broadcast finished",
            format!(
                "Broadcast {} delivered to {} of {} users ({} failed)",
                broadcast_id, success, total, failed
            ),
        )
        .with_data(json!({
            "broadcast_id": broadcast_id,
            "status": status.as_str(),
            "total": total,
            "success": success,
            "failed": failed,
        }))
        .with_link(format!("/broadcasts/{}", broadcast_id))
    }

    pub fn system_error(context: &str, error: &dyn std::fmt::Display) -> Self {
        Self::new(
            NotificationCategory::SystemError,
            "System error",
            format!("{}: {}", context, error),
        )
    }

    pub fn envelope(&self, timestamp: i64) -> WsEnvelope {
        WsEnvelope {
            kind: "notification".to_string(),
            category: Some(self.category.as_str().to_string()),
            title: Some(self.title.clone()),
            message: Some(self.message.clone()),
            data: self.data.clone(),
            priority: Some(self.priority.as_str().to_string()),
            sound: self.sound,
            link: self.link.clone(),
            timestamp,
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    storage: Arc<Storage>,
    hub: AdminHub,
}

impl Notifier {
    pub fn new(storage: Arc<Storage>, hub: AdminHub) -> Self {
        Self { storage, hub }
    }

    pub fn hub(&self) -> &AdminHub {
        &self.hub
    }

    /// Persist the event in the background and push it to every admin.
    /// Stored unaddressed, so every admin sees it in the notification list.
    pub fn publish(&self, event: AdminEvent) {
        if let Some(frame) = self.emit(None, event) {
            self.hub.publish(frame);
        }
    }

    /// Persist the event for one admin and push it to each of their sessions.
    pub fn send_to(&self, admin_id: i64, event: AdminEvent) {
        if let Some(frame) = self.emit(Some(admin_id), event) {
            self.hub.send_to(admin_id, frame);
        }
    }

    fn emit(&self, admin_id: Option<i64>, event: AdminEvent) -> Option<Frame> {
        let now = unix_now();
        let frame = match serde_json::to_string(&event.envelope(now)) {
            Ok(text) => Arc::<str>::from(text),
            Err(e) => {
                tracing::warn!("Failed to encode admin event: {}", e);
                return None;
            }
        };

        let storage = Arc::clone(&self.storage);
        tokio::spawn(async move {
            let data = event.data.to_string();
            if let Err(e) = storage
                .insert_notification(
                    admin_id,
                    event.category.as_str(),
                    event.priority.as_str(),
                    &event.title,
                    &event.message,
                    &data,
                    now,
                )
                .await
            {
                tracing::warn!(category = event.category.as_str(), "Failed to persist admin notification: {}", e);
            }
        });

        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_event_category_and_decimal_counts() {
        let done = AdminEvent::broadcast_finished(12, BroadcastStatus::Completed, 5, 0);
        assert_eq!(done.category, NotificationCategory::BroadcastComplete);
        assert_eq!(done.message, "Broadcast 12 delivered to 5 of 5 users (0 failed)");

        let partial = AdminEvent::broadcast_finished(13, BroadcastStatus::PartialFailed, 3, 2);
        assert_eq!(partial.category, NotificationCategory::BroadcastFailed);
        assert_eq!(partial.priority, Priority::High);
        assert!(partial.sound);
        assert_eq!(partial.data["total"], 5);
    }

    #[test]
    fn test_envelope_shape() {
        let event = AdminEvent::new(NotificationCategory::ServiceUp, "Up", "All good");
        let value = serde_json::to_value(event.envelope(1700000000)).unwrap();
        assert_eq!(value["type"], "notification");
        assert_eq!(value["category"], "service_up");
        assert_eq!(value["priority"], "normal");
        assert_eq!(value["timestamp"], 1700000000);
        assert!(value.get("link").is_none());
    }

    #[tokio::test]
    async fn test_publish_persists_and_fans_out() {
        let storage = Arc::new(Storage::in_memory().await.unwrap());
        let hub = AdminHub::new("admin", 16);
        let mut sub = hub.register(1).await.unwrap();
        let notifier = Notifier::new(Arc::clone(&storage), hub);

        notifier.publish(AdminEvent::new(NotificationCategory::ServiceDown, "Down", "db gone"));

        let frame = sub.rx.recv().await.unwrap();
        let envelope: WsEnvelope = serde_json::from_str(&frame).unwrap();
        assert_eq!(envelope.category.as_deref(), Some("service_down"));
        assert_eq!(envelope.priority.as_deref(), Some("urgent"));

        let mut stored = Vec::new();
        for _ in 0..50 {
            stored = storage.list_notifications(1, 10, 0).await.unwrap();
            if !stored.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].category, "service_down");
    }

    #[tokio::test]
    async fn test_send_to_reaches_only_that_admin() {
        let storage = Arc::new(Storage::in_memory().await.unwrap());
        let hub = AdminHub::new("admin", 16);
        let mut first = hub.register(1).await.unwrap();
        let mut second = hub.register(1).await.unwrap();
        let mut other = hub.register(2).await.unwrap();
        let notifier = Notifier::new(Arc::clone(&storage), hub);

        notifier.send_to(1, AdminEvent::broadcast_finished(7, BroadcastStatus::Completed, 2, 0));
        notifier.publish(AdminEvent::new(NotificationCategory::ServiceDown, "Down", "db gone"));

        for sub in [&mut first, &mut second] {
            let frame = sub.rx.recv().await.unwrap();
            let envelope: WsEnvelope = serde_json::from_str(&frame).unwrap();
            assert_eq!(envelope.category.as_deref(), Some("broadcast_complete"));
        }
        // the targeted frame was dispatched first, so admin 2 sees the global one next
        let frame = other.rx.recv().await.unwrap();
        let envelope: WsEnvelope = serde_json::from_str(&frame).unwrap();
        assert_eq!(envelope.category.as_deref(), Some("service_down"));

        let mut stored = Vec::new();
        for _ in 0..50 {
            stored = storage.list_notifications(1, 10, 0).await.unwrap();
            if stored.len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(stored.len(), 2);
        let for_other = storage.list_notifications(2, 10, 0).await.unwrap();
        assert_eq!(for_other.len(), 1);
        assert_eq!(for_other[0].category, "service_down");

        let targeted = stored.iter().find(|n| n.category == "broadcast_complete").unwrap();
        assert!(!storage.mark_notification_read(targeted.id, 2).await.unwrap());
        assert!(storage.mark_notification_read(targeted.id, 1).await.unwrap());
    }
}
