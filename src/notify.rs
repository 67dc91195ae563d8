use serde::Serialize;
use tokio::sync::mpsc;

use crate::types::{ChatMessage, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastLevel {
    Success,
    Info,
    Error,
}

/// Effects pushed to the connected client, serialized as `{event, data}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum UiEvent {
    #[serde(rename = "session:started")]
    SessionStarted { session: Session },
    #[serde(rename = "session:history", rename_all = "camelCase")]
    SessionHistory {
        session: Session,
        messages: Vec<ChatMessage>,
    },
    #[serde(rename = "message:new", rename_all = "camelCase")]
    MessageNew {
        message: ChatMessage,
        escalation_hint: bool,
    },
    #[serde(rename = "feedback:target", rename_all = "camelCase")]
    FeedbackTarget {
        session_id: String,
        message_id: Option<String>,
    },
    #[serde(rename = "escalation:offer", rename_all = "camelCase")]
    EscalationOffer {
        session_id: String,
        user_message_count: u32,
    },
    #[serde(rename = "session:closed", rename_all = "camelCase")]
    SessionClosed {
        session_id: String,
        show_survey: bool,
    },
    #[serde(rename = "survey:show", rename_all = "camelCase")]
    SurveyShow { session_id: String },
    #[serde(rename = "navigate")]
    Navigate { to: String },
    #[serde(rename = "toast")]
    Toast { level: ToastLevel, text: String },
}

pub fn event_payload(event: &UiEvent) -> Option<String> {
    serde_json::to_string(event).ok()
}

/// Fire-and-forget delivery; a gone client never blocks the controller.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl Notifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: UiEvent) {
        let _ = self.tx.send(event);
    }

    pub fn toast(&self, level: ToastLevel, text: impl Into<String>) {
        self.emit(UiEvent::Toast {
            level,
            text: text.into(),
        });
    }
}
