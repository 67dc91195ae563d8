use std::{fmt, sync::atomic::AtomicUsize, sync::Arc};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    identity::{PrincipalProvider, UserDirectory},
    responder::Responder,
    store::ChatStore,
    ui_state::UiStateStore,
};

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    /// Older rows stored assistant turns as "ai".
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Role::User),
            "assistant" | "ai" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Closed => "closed",
        }
    }

    /// Anything that is not explicitly active is treated as closed.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("active") {
            SessionStatus::Active
        } else {
            SessionStatus::Closed
        }
    }
}

/// Verified identifier of the authenticated user that owns a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Only identity resolution and store row mapping construct owner ids.
    pub(crate) fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub owner_id: OwnerId,
    pub status: SessionStatus,
    pub resolved: bool,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<String>,
}

impl Session {
    pub fn new(owner_id: OwnerId) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id,
            status: SessionStatus::Active,
            resolved: false,
            created_at: now_iso(),
            closed_at: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status == SessionStatus::Closed
    }

    pub fn title(&self) -> String {
        session_title(&self.id)
    }
}

/// "Mission" label built from the tail of the session id.
pub fn session_title(session_id: &str) -> String {
    let tail_start = session_id
        .char_indices()
        .rev()
        .nth(7)
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    format!("Mission {}", session_id[tail_start..].to_ascii_uppercase())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: String,
    /// Display hint only; never written to the store.
    #[serde(default)]
    pub skip_replay: bool,
}

impl ChatMessage {
    pub fn new(session_id: &str, role: Role, content: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            content: content.trim().to_string(),
            created_at: now_iso(),
            skip_replay: false,
        }
    }
}

/// Authenticated caller as reported by the identity provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Pre-resolved owner claim carried by the token, unverified.
    #[serde(default)]
    pub owner_id_claim: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponderReply {
    pub reply: String,
    #[serde(default)]
    pub resolved_hint: bool,
    #[serde(default)]
    pub escalation_hint: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub status: SessionStatus,
    pub resolved: bool,
    pub created_at: String,
    pub closed_at: Option<String>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            title: session.title(),
            status: session.status,
            resolved: session.resolved,
            created_at: session.created_at.clone(),
            closed_at: session.closed_at.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurveyResponse {
    pub id: String,
    pub session_id: String,
    pub owner_id: OwnerId,
    pub score: i32,
    pub comment: String,
    pub submitted_at: String,
}

pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn ChatStore>,
    pub directory: Arc<dyn UserDirectory>,
    pub principals: Arc<dyn PrincipalProvider>,
    pub responder: Arc<dyn Responder>,
    pub ui_store: Arc<dyn UiStateStore>,
    pub next_client_id: AtomicUsize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurveyBody {
    pub score: i32,
    pub comment: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryParams {
    pub search: Option<String>,
    pub range: Option<String>,
    pub sort: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}
