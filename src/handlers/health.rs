//! Liveness check

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "clients": state.updates.hub().client_count(),
        "admins": state.notifier.hub().client_count(),
    }))
}
