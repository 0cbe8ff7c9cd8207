//! Data models for Relaygram Server

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ============================================================================
// User Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub access_hash: i64,
    pub phone: String,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub status: String,
    pub last_online: i64,
    pub is_banned: bool,
    pub ban_expires_at: Option<i64>,
    pub ban_reason: Option<String>,
    pub is_bot: bool,
    pub is_deleted: bool,
    pub created_at: i64,
}

impl User {
    /// The reason of a ban still in force at `now`. A ban without expiry is permanent.
    pub fn active_ban(&self, now: i64) -> Option<String> {
        if !self.is_banned {
            return None;
        }
        match self.ban_expires_at {
            Some(expires) if expires <= now => None,
            _ => Some(
                self.ban_reason
                    .clone()
                    .unwrap_or_else(|| "account banned".to_string()),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Online,
    Offline,
    Recently,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Online => "online",
            UserStatus::Offline => "offline",
            UserStatus::Recently => "recently",
        }
    }
}

/// The user object as it appears on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct UserView {
    #[serde(rename = "_")]
    pub kind: &'static str,
    pub id: i64,
    pub access_hash: i64,
    pub first_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub phone: String,
    pub status: String,
    pub bot: bool,
}

impl From<User> for UserView {
    fn from(user: User) -> Self {
        Self {
            kind: "user",
            id: user.id,
            access_hash: user.access_hash,
            first_name: user.first_name,
            last_name: user.last_name,
            username: user.username,
            phone: user.phone,
            status: user.status,
            bot: user.is_bot,
        }
    }
}

// ============================================================================
// Session Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: i64,
    pub auth_key_id: i64,
    pub user_id: i64,
    pub last_active: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UniversalCode {
    pub id: i64,
    pub code: String,
    pub is_active: bool,
    pub usage_count: i64,
    pub created_at: i64,
}

// ============================================================================
// Authorization Responses
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SentCodeType {
    #[serde(rename = "_")]
    pub kind: &'static str,
    pub length: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SentCode {
    #[serde(rename = "_")]
    pub kind: &'static str,
    #[serde(rename = "type")]
    pub code_type: SentCodeType,
    pub phone_code_hash: String,
    pub timeout: u64,
    pub is_new: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "_")]
pub enum Authorization {
    #[serde(rename = "auth.authorization")]
    Authorized { user: UserView },

    #[serde(rename = "auth.authorizationSignUpRequired")]
    SignUpRequired { phone_code_hash: String },
}

// ============================================================================
// Update Log Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    NewMessage,
    EditMessage,
    ReadHistory,
    DeleteMessages,
    UserStatus,
    PhoneCall,
}

impl UpdateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateType::NewMessage => "newMessage",
            UpdateType::EditMessage => "editMessage",
            UpdateType::ReadHistory => "readHistory",
            UpdateType::DeleteMessages => "deleteMessages",
            UpdateType::UserStatus => "userStatus",
            UpdateType::PhoneCall => "phoneCallUpdate",
        }
    }

    /// Updates that carry message bodies rather than state changes.
    pub fn is_message(kind: &str) -> bool {
        kind == UpdateType::NewMessage.as_str() || kind == UpdateType::EditMessage.as_str()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UpdateRecord {
    pub id: i64,
    pub user_id: i64,
    pub pts: i64,
    pub update_type: String,
    pub payload: String,
    pub date: i64,
}

impl UpdateRecord {
    pub fn payload_value(&self) -> Value {
        serde_json::from_str(&self.payload).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UpdateState {
    pub pts: i64,
    pub qts: i64,
    pub seq: i64,
    pub date: i64,
    pub unread_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateView {
    #[serde(rename = "_")]
    pub kind: &'static str,
    pub pts: i64,
    pub qts: i64,
    pub seq: i64,
    pub date: i64,
    pub unread_count: i64,
}

impl From<UpdateState> for StateView {
    fn from(state: UpdateState) -> Self {
        Self {
            kind: "updates.state",
            pts: state.pts,
            qts: state.qts,
            seq: state.seq,
            date: state.date,
            unread_count: state.unread_count,
        }
    }
}

/// A non-message update as it appears in `other_updates`.
#[derive(Debug, Clone, Serialize)]
pub struct OtherUpdate {
    #[serde(rename = "_")]
    pub kind: String,
    pub pts: i64,
    pub date: i64,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "_")]
pub enum Difference {
    #[serde(rename = "updates.differenceEmpty")]
    Empty { date: i64, seq: i64 },

    #[serde(rename = "updates.difference")]
    Full {
        new_messages: Vec<Value>,
        other_updates: Vec<OtherUpdate>,
        state: StateView,
    },

    #[serde(rename = "updates.differenceSlice")]
    Slice {
        new_messages: Vec<Value>,
        other_updates: Vec<OtherUpdate>,
        intermediate_state: StateView,
    },

    #[serde(rename = "updates.differenceTooLong")]
    TooLong { pts: i64 },
}

// ============================================================================
// Message Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: i64,
    pub from_id: i64,
    pub peer_id: i64,
    pub message: String,
    pub date: i64,
    pub edit_date: Option<i64>,
    pub is_deleted: bool,
}

impl Message {
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "_": "message",
            "id": self.id,
            "from_id": self.from_id,
            "peer_id": self.peer_id,
            "message": self.message,
            "date": self.date,
            "edit_date": self.edit_date,
        })
    }
}

// ============================================================================
// Call Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Pending,
    Ringing,
    Accepted,
    Ended,
    Missed,
    Declined,
    Busy,
}

impl CallState {
    pub const ALL: [CallState; 7] = [
        CallState::Pending,
        CallState::Ringing,
        CallState::Accepted,
        CallState::Ended,
        CallState::Missed,
        CallState::Declined,
        CallState::Busy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Pending => "pending",
            CallState::Ringing => "ringing",
            CallState::Accepted => "accepted",
            CallState::Ended => "ended",
            CallState::Missed => "missed",
            CallState::Declined => "declined",
            CallState::Busy => "busy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallState::Pending | CallState::Ringing | CallState::Accepted)
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Call {
    pub id: i64,
    pub access_hash: i64,
    pub caller_id: i64,
    pub callee_id: i64,
    pub is_video: bool,
    pub g_a_hash: Vec<u8>,
    pub g_b: Option<Vec<u8>>,
    pub key_fingerprint: Option<i64>,
    pub confirmed_fingerprint: Option<i64>,
    pub protocol: Option<String>,
    pub state: String,
    pub duration: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Call {
    pub fn call_state(&self) -> CallState {
        // rows are only ever written through CallState::as_str
        CallState::parse(&self.state).unwrap_or(CallState::Ended)
    }

    pub fn protocol_value(&self) -> Option<Value> {
        self.protocol.as_deref().and_then(|p| serde_json::from_str(p).ok())
    }
}

/// Opaque handshake material, base64 on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Blob(pub Vec<u8>);

impl Serialize for Blob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Blob)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "_")]
pub enum PhoneCallView {
    #[serde(rename = "phoneCallRequested")]
    Requested {
        id: i64,
        access_hash: i64,
        date: i64,
        admin_id: i64,
        participant_id: i64,
        g_a_hash: Blob,
        video: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        protocol: Option<Value>,
    },

    #[serde(rename = "phoneCallWaiting")]
    Waiting {
        id: i64,
        access_hash: i64,
        date: i64,
        admin_id: i64,
        participant_id: i64,
        video: bool,
        receive_date: i64,
    },

    #[serde(rename = "phoneCallAccepted")]
    Accepted {
        id: i64,
        access_hash: i64,
        date: i64,
        admin_id: i64,
        participant_id: i64,
        g_b: Blob,
        key_fingerprint: i64,
        video: bool,
    },

    #[serde(rename = "phoneCall")]
    Confirmed {
        id: i64,
        access_hash: i64,
        date: i64,
        admin_id: i64,
        participant_id: i64,
        key_fingerprint: i64,
        video: bool,
        start_date: i64,
    },

    #[serde(rename = "phoneCallDiscarded")]
    Discarded {
        id: i64,
        reason: String,
        duration: i64,
        video: bool,
    },
}

impl From<&Call> for PhoneCallView {
    fn from(call: &Call) -> Self {
        match call.call_state() {
            CallState::Pending => PhoneCallView::Requested {
                id: call.id,
                access_hash: call.access_hash,
                date: call.created_at,
                admin_id: call.caller_id,
                participant_id: call.callee_id,
                g_a_hash: Blob(call.g_a_hash.clone()),
                video: call.is_video,
                protocol: call.protocol_value(),
            },
            CallState::Ringing => PhoneCallView::Waiting {
                id: call.id,
                access_hash: call.access_hash,
                date: call.created_at,
                admin_id: call.caller_id,
                participant_id: call.callee_id,
                video: call.is_video,
                receive_date: call.updated_at,
            },
            CallState::Accepted => match call.confirmed_fingerprint {
                Some(fingerprint) => PhoneCallView::Confirmed {
                    id: call.id,
                    access_hash: call.access_hash,
                    date: call.created_at,
                    admin_id: call.caller_id,
                    participant_id: call.callee_id,
                    key_fingerprint: fingerprint,
                    video: call.is_video,
                    start_date: call.updated_at,
                },
                None => PhoneCallView::Accepted {
                    id: call.id,
                    access_hash: call.access_hash,
                    date: call.created_at,
                    admin_id: call.caller_id,
                    participant_id: call.callee_id,
                    g_b: Blob(call.g_b.clone().unwrap_or_default()),
                    key_fingerprint: call.key_fingerprint.unwrap_or_default(),
                    video: call.is_video,
                },
            },
            terminal => PhoneCallView::Discarded {
                id: call.id,
                reason: terminal.as_str().to_string(),
                duration: call.duration,
                video: call.is_video,
            },
        }
    }
}

// ============================================================================
// Broadcast Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastStatus {
    Pending,
    Sending,
    Completed,
    PartialFailed,
    Failed,
}

impl BroadcastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastStatus::Pending => "pending",
            BroadcastStatus::Sending => "sending",
            BroadcastStatus::Completed => "completed",
            BroadcastStatus::PartialFailed => "partial_failed",
            BroadcastStatus::Failed => "failed",
        }
    }

    /// Terminal status for the given delivery counters.
    pub fn from_counts(success: i64, failed: i64) -> Self {
        match (success, failed) {
            (_, 0) => BroadcastStatus::Completed,
            (0, _) => BroadcastStatus::Failed,
            _ => BroadcastStatus::PartialFailed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    All,
    Online,
    Custom(Vec<i64>),
}

impl TargetSelector {
    /// Unknown selector kinds fall back to everyone.
    pub fn parse(target_type: &str, target_ids: &[i64]) -> Self {
        match target_type {
            "online" => TargetSelector::Online,
            "custom" => TargetSelector::Custom(target_ids.to_vec()),
            _ => TargetSelector::All,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Broadcast {
    pub id: i64,
    pub admin_id: i64,
    pub title: String,
    pub message: String,
    pub target_type: String,
    pub target_ids: String,
    pub status: String,
    pub total: i64,
    pub success: i64,
    pub failed: i64,
    pub scheduled_at: Option<i64>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl Broadcast {
    pub fn target_id_list(&self) -> Vec<i64> {
        serde_json::from_str(&self.target_ids).unwrap_or_default()
    }

    pub fn selector(&self) -> TargetSelector {
        TargetSelector::parse(&self.target_type, &self.target_id_list())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BroadcastDetail {
    pub id: i64,
    pub broadcast_id: i64,
    pub user_id: i64,
    pub status: String,
    pub error: Option<String>,
    pub attempts: i64,
    pub updated_at: i64,
}

pub const DETAIL_SUCCESS: &str = "success";
pub const DETAIL_FAILED: &str = "failed";

// ============================================================================
// Admin Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Admin {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: String,
    pub is_active: bool,
    pub created_at: i64,
    pub last_login: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    UserRegister,
    UserLogin,
    CallStart,
    CallEnd,
    ServiceDown,
    ServiceUp,
    SystemError,
    BroadcastComplete,
    BroadcastFailed,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationCategory::UserRegister => "user_register",
            NotificationCategory::UserLogin => "user_login",
            NotificationCategory::CallStart => "call_start",
            NotificationCategory::CallEnd => "call_end",
            NotificationCategory::ServiceDown => "service_down",
            NotificationCategory::ServiceUp => "service_up",
            NotificationCategory::SystemError => "system_error",
            NotificationCategory::BroadcastComplete => "broadcast_complete",
            NotificationCategory::BroadcastFailed => "broadcast_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AdminNotification {
    pub id: i64,
    pub admin_id: Option<i64>,
    pub category: String,
    pub priority: String,
    pub title: String,
    pub message: String,
    pub data: String,
    pub is_read: bool,
    pub created_at: i64,
}

// ============================================================================
// WebSocket Models
// ============================================================================

/// One frame body on either WebSocket surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WsEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default)]
    pub sound: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    pub timestamp: i64,
}

// ============================================================================
// API Request/Response Models
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SendCodeRequest {
    pub phone: String,
    pub api_id: i64,
    pub api_hash: String,
}

#[derive(Debug, Deserialize)]
pub struct SignInRequest {
    pub phone: String,
    #[serde(default)]
    pub phone_code_hash: String,
    pub phone_code: String,
}

#[derive(Debug, Deserialize)]
pub struct SignUpRequest {
    pub phone: String,
    #[serde(default)]
    pub phone_code_hash: String,
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GetDifferenceRequest {
    pub pts: i64,
    #[serde(default)]
    pub qts: i64,
    #[serde(default)]
    pub date: i64,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub peer_id: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub id: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ReadHistoryRequest {
    pub peer_id: i64,
    pub max_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct DeleteMessagesRequest {
    pub ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    #[serde(default)]
    pub offline: bool,
}

#[derive(Debug, Deserialize)]
pub struct RequestCallRequest {
    pub user_id: i64,
    #[serde(default)]
    pub video: bool,
    pub g_a_hash: Blob,
    #[serde(default)]
    pub protocol: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct CallIdRequest {
    pub call_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct AcceptCallRequest {
    pub call_id: i64,
    pub g_b: Blob,
    pub key_fingerprint: i64,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmCallRequest {
    pub call_id: i64,
    pub key_fingerprint: i64,
}

#[derive(Debug, Deserialize)]
pub struct DiscardCallRequest {
    pub call_id: i64,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub duration: i64,
}

#[derive(Debug, Deserialize)]
pub struct SendBroadcastRequest {
    #[serde(default)]
    pub title: String,
    pub message: String,
    pub target_type: String,
    #[serde(default)]
    pub target_ids: Vec<i64>,
    #[serde(default)]
    pub scheduled_at: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SendBroadcastResponse {
    pub id: i64,
    pub total_users: i64,
}

#[derive(Debug, Serialize)]
pub struct BroadcastWithDetails {
    #[serde(flatten)]
    pub broadcast: Broadcast,
    pub details: Vec<BroadcastDetail>,
}

#[derive(Debug, Deserialize)]
pub struct AdminLoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AdminLoginResponse {
    pub token: String,
    pub expires_at: i64,
    pub admin: Admin,
}

#[derive(Debug, Deserialize)]
pub struct BanUserRequest {
    #[serde(default)]
    pub reason: Option<String>,
    /// Ban length in seconds; absent means permanent.
    #[serde(default)]
    pub duration_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_page_limit() -> i64 {
    50
}

#[derive(Debug, Serialize)]
pub struct ServerStats {
    pub total_users: i64,
    pub banned_users: i64,
    pub online_users: i64,
    pub connected_clients: usize,
    pub connected_admins: usize,
    pub active_calls: i64,
    pub pending_broadcasts: i64,
}
