use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use crate::{
    error::{ChatError, ChatResult},
    types::{ResponderReply, Session},
};

/// External AI responder. Its hints are rendered as-is; the controller
/// never recomputes resolution or time-based escalation.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn send_user_message(&self, session: &Session, content: &str)
        -> ChatResult<ResponderReply>;
}

pub struct WebhookResponder {
    client: reqwest::Client,
    url: String,
}

impl WebhookResponder {
    pub fn new(url: impl Into<String>, timeout: Duration) -> ChatResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Responder for WebhookResponder {
    async fn send_user_message(
        &self,
        session: &Session,
        content: &str,
    ) -> ChatResult<ResponderReply> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "chat_id": session.id,
                "user_id": session.owner_id.as_str(),
                "message": content,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::TransientIo(format!(
                "responder returned {status}"
            )));
        }

        let raw = response.text().await?;
        parse_responder_reply(&raw).ok_or_else(|| {
            tracing::warn!(session_id = %session.id, "responder reply had no usable text");
            ChatError::TransientIo("responder returned an empty reply".to_string())
        })
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) => {
            matches!(text.trim().to_ascii_lowercase().as_str(), "yes" | "true")
        }
        _ => false,
    }
}

/// Removes a trailing `###CONTROL: {...}` block and reports whether it
/// declared the issue resolved.
pub fn strip_control_block(reply: &str) -> (String, bool) {
    let Ok(re) = Regex::new(r"(?s)###CONTROL:\s*(\{.*?\})") else {
        return (reply.trim().to_string(), false);
    };
    let Some(captures) = re.captures(reply) else {
        return (reply.trim().to_string(), false);
    };
    let resolved = captures
        .get(1)
        .and_then(|block| serde_json::from_str::<Value>(block.as_str()).ok())
        .map(|control| truthy(control.get("resolved")))
        .unwrap_or(false);
    let visible = re.replace_all(reply, "").trim().to_string();
    (visible, resolved)
}

pub fn parse_responder_reply(raw: &str) -> Option<ResponderReply> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let parsed = serde_json::from_str::<Value>(trimmed).ok();
    // Webhook runners often wrap the item in a one-element array.
    let item = match parsed {
        Some(Value::Array(items)) => items.into_iter().next(),
        other => other,
    };

    let Some(Value::Object(obj)) = item else {
        let (reply, resolved_hint) = strip_control_block(trimmed);
        return (!reply.is_empty()).then_some(ResponderReply {
            reply,
            resolved_hint,
            escalation_hint: false,
        });
    };

    let text = ["response", "reply", "output", "message"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
        .unwrap_or_default();
    let (reply, control_resolved) = strip_control_block(text);
    if reply.is_empty() {
        return None;
    }

    let resolved_hint = control_resolved
        || truthy(obj.get("resolved"))
        || truthy(obj.get("resolvedHint"));
    let escalation_hint = truthy(obj.get("escalation_prompted"))
        || truthy(obj.get("escalationHint"));

    Some(ResponderReply {
        reply,
        resolved_hint,
        escalation_hint,
    })
}
