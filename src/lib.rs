//! Relaygram Server - real-time core of a Telegram-style messaging backend
//!
//! This crate handles:
//! - Transport-key session binding and phone verification
//! - The per-user `pts` update log and difference reconciliation
//! - WebSocket push for clients and admin consoles
//! - Admin broadcasts with per-recipient delivery tracking
//! - Call signaling

pub mod auth;
pub mod broadcast;
pub mod calls;
pub mod config;
pub mod crypto;
pub mod ephemeral;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod models;
pub mod notify;
pub mod storage;
pub mod updates;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{JwtKeys, SessionBinder, Verification};
use crate::broadcast::BroadcastDispatcher;
use crate::calls::CallService;
use crate::config::Config;
use crate::ephemeral::EphemeralStore;
use crate::notify::{AdminHub, Notifier};
use crate::storage::Storage;
use crate::updates::{ClientHub, UpdateLog};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Arc<Storage>,
    pub ephemeral: Arc<EphemeralStore>,
    pub sessions: SessionBinder,
    pub verification: Verification,
    pub jwt: JwtKeys,
    pub updates: UpdateLog,
    pub calls: CallService,
    pub broadcasts: BroadcastDispatcher,
    pub notifier: Notifier,
}

impl AppState {
    /// Wire every service together. Spawns the hub coordinators, so this must
    /// run inside a Tokio runtime.
    pub fn new(config: Config, storage: Storage) -> Self {
        let config = Arc::new(config);
        let storage = Arc::new(storage);
        let ephemeral = Arc::new(EphemeralStore::new());
        let limits = &config.limits;

        let notifier = Notifier::new(Arc::clone(&storage), AdminHub::new("admin", limits.hub_queue_capacity));
        let updates = UpdateLog::new(
            Arc::clone(&storage),
            ClientHub::new("clients", limits.hub_queue_capacity),
            limits.difference_limit,
        );
        let sessions = SessionBinder::new(
            Arc::clone(&storage),
            Arc::clone(&ephemeral),
            Duration::from_secs(limits.presence_ttl_seconds),
        );
        let verification = Verification::new(
            Arc::clone(&storage),
            Arc::clone(&ephemeral),
            sessions.clone(),
            notifier.clone(),
            Duration::from_secs(limits.code_ttl_seconds),
        );
        let calls = CallService::new(Arc::clone(&storage), updates.clone(), notifier.clone());
        let broadcasts = BroadcastDispatcher::new(
            Arc::clone(&storage),
            Arc::new(updates.clone()),
            notifier.clone(),
            limits.presence_ttl_seconds as i64,
        );
        let jwt = JwtKeys::new(&config.admin.jwt_secret, config.admin.token_ttl_hours);

        Self {
            config,
            storage,
            ephemeral,
            sessions,
            verification,
            jwt,
            updates,
            calls,
            broadcasts,
            notifier,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let request_timeout = Duration::from_secs(state.config.server.request_timeout_secs.max(1));

    Router::new()
        // Health check
        .route("/health", get(handlers::health::health_check))

        // Authentication
        .route("/auth/sendCode", post(handlers::auth::send_code))
        .route("/auth/signIn", post(handlers::auth::sign_in))
        .route("/auth/signUp", post(handlers::auth::sign_up))

        // Update log
        .route("/updates/getState", get(handlers::updates::get_state).post(handlers::updates::get_state))
        .route("/updates/getDifference", post(handlers::updates::get_difference))

        // Messages
        .route("/messages/sendMessage", post(handlers::messages::send_message))
        .route("/messages/editMessage", post(handlers::messages::edit_message))
        .route("/messages/readHistory", post(handlers::messages::read_history))
        .route("/messages/deleteMessages", post(handlers::messages::delete_messages))

        // Account
        .route("/account/updateStatus", post(handlers::account::update_status))

        // Calls
        .route("/phone/requestCall", post(handlers::phone::request_call))
        .route("/phone/receivedCall", post(handlers::phone::received_call))
        .route("/phone/acceptCall", post(handlers::phone::accept_call))
        .route("/phone/confirmCall", post(handlers::phone::confirm_call))
        .route("/phone/discardCall", post(handlers::phone::discard_call))
        .route("/phone/getCall", post(handlers::phone::get_call))

        // Broadcasts
        .route(
            "/api/v1/broadcasts",
            post(handlers::broadcasts::send_broadcast).get(handlers::broadcasts::list_broadcasts),
        )
        .route("/api/v1/broadcasts/:id", get(handlers::broadcasts::get_broadcast))
        .route("/api/v1/broadcasts/:id/retry", post(handlers::broadcasts::retry_broadcast))

        // Admin console
        .route("/admin/login", post(handlers::admin::login))
        .route("/api/admin/notifications", get(handlers::admin::list_notifications))
        .route("/api/admin/notifications/:id/read", post(handlers::admin::mark_notification_read))
        .route("/api/admin/stats", get(handlers::admin::get_stats))
        .route("/api/admin/users/:id/ban", post(handlers::admin::ban_user))
        .route("/api/admin/users/:id/unban", post(handlers::admin::unban_user))
        .route("/api/admin/users/:id", delete(handlers::admin::delete_user))

        // WebSocket push streams
        .route("/ws", get(handlers::websocket::client_ws))
        .route("/api/admin/ws", get(handlers::websocket::admin_ws))

        // Add middleware
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
