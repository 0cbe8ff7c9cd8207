//! Call signaling.
//!
//! ```text
//! (new) --request--> pending --received--> ringing
//! pending | ringing --accept--> accepted --confirm--> accepted
//! any open state --discard--> ended | missed | declined | busy
//! ```
//!
//! Only the callee may mark a call received or accept it, only the caller may
//! confirm, and either side may discard. Every transition is a compare-and-set
//! on the stored state and is reported to both participants through the
//! update log.

use serde_json::json;
use std::sync::Arc;

use crate::{
    error::{conflict_on_unique, AppError, Result},
    models::*,
    notify::{AdminEvent, Notifier},
    storage::{CallChanges, Storage},
    updates::UpdateLog,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOp {
    Received,
    Accept,
    Confirm,
    Discard(CallState),
}

impl CallOp {
    pub fn name(&self) -> &'static str {
        match self {
            CallOp::Received => "receive",
            CallOp::Accept => "accept",
            CallOp::Confirm => "confirm",
            CallOp::Discard(_) => "discard",
        }
    }

    pub fn permits(&self, role: Role) -> bool {
        match self {
            CallOp::Received | CallOp::Accept => role == Role::Callee,
            CallOp::Confirm => role == Role::Caller,
            CallOp::Discard(_) => true,
        }
    }
}

/// The state `op` leads to from `from`, if that edge exists.
pub fn next_state(from: CallState, op: CallOp) -> Option<CallState> {
    match (from, op) {
        (CallState::Pending, CallOp::Received) => Some(CallState::Ringing),
        (CallState::Pending | CallState::Ringing, CallOp::Accept) => Some(CallState::Accepted),
        (CallState::Accepted, CallOp::Confirm) => Some(CallState::Accepted),
        (from, CallOp::Discard(to)) if !from.is_terminal() && to.is_terminal() => Some(to),
        _ => None,
    }
}

pub fn discard_state(reason: &str) -> CallState {
    match reason {
        "busy" => CallState::Busy,
        "decline" => CallState::Declined,
        "missed" => CallState::Missed,
        _ => CallState::Ended,
    }
}

pub fn role_of(call: &Call, user_id: i64) -> Option<Role> {
    if call.caller_id == user_id {
        Some(Role::Caller)
    } else if call.callee_id == user_id {
        Some(Role::Callee)
    } else {
        None
    }
}

#[derive(Clone)]
pub struct CallService {
    storage: Arc<Storage>,
    updates: UpdateLog,
    notifier: Notifier,
}

impl CallService {
    pub fn new(storage: Arc<Storage>, updates: UpdateLog, notifier: Notifier) -> Self {
        Self {
            storage,
            updates,
            notifier,
        }
    }

    pub async fn request_call(&self, caller_id: i64, req: &RequestCallRequest) -> Result<Call> {
        if req.user_id == caller_id {
            return Err(AppError::InvalidArgument("cannot call yourself".into()));
        }
        if req.g_a_hash.0.is_empty() {
            return Err(AppError::InvalidArgument("g_a_hash is required".into()));
        }

        let callee = self
            .storage
            .get_user(req.user_id)
            .await?
            .filter(|u| !u.is_deleted)
            .ok_or_else(|| AppError::NotFound(format!("user {}", req.user_id)))?;

        if self.storage.open_call_between(caller_id, callee.id).await?.is_some() {
            return Err(AppError::Conflict("CALL_ALREADY_ACTIVE".into()));
        }

        let protocol = req.protocol.as_ref().map(|p| p.to_string());
        let call = self
            .storage
            .create_call(
                caller_id,
                callee.id,
                req.video,
                &req.g_a_hash.0,
                protocol.as_deref(),
                unix_now(),
            )
            .await
            .map_err(|e| conflict_on_unique(e, "CALL_ALREADY_ACTIVE"))?;

        tracing::info!(call_id = call.id, caller_id = caller_id, callee_id = callee.id, "Call requested");
        self.emit(&call).await?;
        self.notifier.publish(AdminEvent::call_started(&call));

        Ok(call)
    }

    pub async fn received_call(&self, user_id: i64, call_id: i64) -> Result<Call> {
        self.transition(user_id, call_id, CallOp::Received, CallChanges::default())
            .await
    }

    pub async fn accept_call(&self, user_id: i64, req: &AcceptCallRequest) -> Result<Call> {
        if req.g_b.0.is_empty() {
            return Err(AppError::InvalidArgument("g_b is required".into()));
        }
        let changes = CallChanges {
            g_b: Some(req.g_b.0.clone()),
            key_fingerprint: Some(req.key_fingerprint),
            ..Default::default()
        };
        self.transition(user_id, req.call_id, CallOp::Accept, changes).await
    }

    pub async fn confirm_call(&self, user_id: i64, req: &ConfirmCallRequest) -> Result<Call> {
        let call = self.load(req.call_id).await?;
        self.authorize(&call, user_id, CallOp::Confirm)?;

        if call.call_state() == CallState::Accepted {
            if call.key_fingerprint != Some(req.key_fingerprint) {
                return Err(AppError::InvalidArgument("KEY_FINGERPRINT_MISMATCH".into()));
            }
            match call.confirmed_fingerprint {
                Some(existing) if existing == req.key_fingerprint => return Ok(call),
                Some(_) => return Err(AppError::Conflict("call already confirmed".into())),
                None => {}
            }
        }

        let changes = CallChanges {
            confirmed_fingerprint: Some(req.key_fingerprint),
            ..Default::default()
        };
        self.apply(call, CallOp::Confirm, changes).await
    }

    pub async fn discard_call(&self, user_id: i64, req: &DiscardCallRequest) -> Result<Call> {
        let call = self.load(req.call_id).await?;
        let op = CallOp::Discard(discard_state(&req.reason));
        self.authorize(&call, user_id, op)?;

        // only a call that was actually connected has a duration
        let duration = match call.call_state() {
            CallState::Accepted => req.duration.max(0),
            _ => 0,
        };
        let changes = CallChanges {
            duration: Some(duration),
            ..Default::default()
        };
        self.apply(call, op, changes).await
    }

    /// A call as seen by one of its participants.
    pub async fn get_call(&self, user_id: i64, call_id: i64) -> Result<Call> {
        let call = self.load(call_id).await?;
        role_of(&call, user_id).ok_or_else(|| AppError::Forbidden("not a participant of this call".into()))?;
        Ok(call)
    }

    async fn load(&self, call_id: i64) -> Result<Call> {
        self.storage
            .get_call(call_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("call {}", call_id)))
    }

    fn authorize(&self, call: &Call, user_id: i64, op: CallOp) -> Result<Role> {
        let role = role_of(call, user_id)
            .ok_or_else(|| AppError::Forbidden("not a participant of this call".into()))?;
        if !op.permits(role) {
            return Err(AppError::Forbidden(format!("only the other party may {} this call", op.name())));
        }
        Ok(role)
    }

    async fn transition(&self, user_id: i64, call_id: i64, op: CallOp, changes: CallChanges) -> Result<Call> {
        let call = self.load(call_id).await?;
        self.authorize(&call, user_id, op)?;
        self.apply(call, op, changes).await
    }

    async fn apply(&self, call: Call, op: CallOp, changes: CallChanges) -> Result<Call> {
        let from = call.call_state();
        let illegal = |state: &str| AppError::IllegalTransition {
            from: state.to_string(),
            op: op.name().to_string(),
        };

        let to = next_state(from, op).ok_or_else(|| illegal(from.as_str()))?;

        let Some(updated) = self
            .storage
            .transition_call(call.id, from, to, &changes, unix_now())
            .await?
        else {
            // lost a race with the other participant
            let current = self.load(call.id).await?;
            return Err(illegal(&current.state));
        };

        tracing::info!(call_id = updated.id, from = %from, to = %to, op = op.name(), "Call transition");
        self.emit(&updated).await?;
        if to.is_terminal() {
            self.notifier.publish(AdminEvent::call_ended(&updated));
        }

        Ok(updated)
    }

    async fn emit(&self, call: &Call) -> Result<()> {
        let payload = json!({
            "_": "updatePhoneCall",
            "phone_call": PhoneCallView::from(call),
        });
        for user_id in [call.caller_id, call.callee_id] {
            self.updates
                .append_update(user_id, UpdateType::PhoneCall, &payload)
                .await?;
        }
        Ok(())
    }
}
