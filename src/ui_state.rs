//! Transient display hints kept outside the authoritative store: which chat
//! is open and which assistant message carries the satisfaction controls.
//! Everything here is safe to lose.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    error::ChatResult,
    satisfaction::SATISFIED_ACK,
    types::{ChatMessage, OwnerId, Role},
};

pub fn mark_replayed(messages: &mut [ChatMessage]) {
    for message in messages.iter_mut() {
        message.skip_replay = true;
    }
}

/// Messages of one session split at the point where the live turn began.
/// Everything before `live_from` came from history; both the reveal
/// animation and feedback eligibility are read off this one boundary.
#[derive(Debug, Clone, Default)]
pub struct MessageTimeline {
    messages: Vec<ChatMessage>,
    live_from: usize,
}

impl MessageTimeline {
    pub fn replayed(mut messages: Vec<ChatMessage>) -> Self {
        mark_replayed(&mut messages);
        let live_from = messages.len();
        Self {
            messages,
            live_from,
        }
    }

    pub fn push_live(&mut self, mut message: ChatMessage) -> ChatMessage {
        message.skip_replay = false;
        self.messages.push(message.clone());
        message
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn is_live(&self, message_id: &str) -> bool {
        self.messages[self.live_from..]
            .iter()
            .any(|m| m.id == message_id)
    }

    /// User messages that count towards escalation. The stored "yes"
    /// acknowledgment is not one of them.
    pub fn user_message_count(&self) -> u32 {
        self.messages
            .iter()
            .filter(|m| m.role == Role::User && m.content != SATISFIED_ACK)
            .count() as u32
    }

    pub fn latest_assistant(&self) -> Option<&ChatMessage> {
        self.messages.iter().rev().find(|m| m.role == Role::Assistant)
    }

    /// The latest assistant message qualifies if it arrived live, or if it
    /// was replayed and the persisted hint names exactly it.
    pub fn feedback_candidate(&self, restored_hint: Option<&str>) -> Option<String> {
        let latest = self.latest_assistant()?;
        if self.is_live(&latest.id) || restored_hint == Some(latest.id.as_str()) {
            return Some(latest.id.clone());
        }
        None
    }
}

#[async_trait]
pub trait UiStateStore: Send + Sync {
    async fn get(&self, key: &str) -> ChatResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> ChatResult<()>;
    async fn remove(&self, key: &str) -> ChatResult<()>;
}

#[derive(Default)]
pub struct MemoryUiStateStore {
    entries: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl UiStateStore for MemoryUiStateStore {
    async fn get(&self, key: &str) -> ChatResult<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> ChatResult<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> ChatResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// One JSON file per key under a directory.
pub struct FileUiStateStore {
    dir: PathBuf,
}

impl FileUiStateStore {
    pub async fn open(dir: PathBuf) -> ChatResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect::<String>();
        self.dir.join(format!("{file_name}.json"))
    }
}

#[async_trait]
impl UiStateStore for FileUiStateStore {
    async fn get(&self, key: &str) -> ChatResult<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> ChatResult<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> ChatResult<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialUiState {
    #[serde(default)]
    pub open_session_id: Option<String>,
    #[serde(default)]
    pub feedback_target: Option<String>,
}

/// UI hints scoped to one owner, so a shared browser profile never shows
/// one user's open chat to another.
#[derive(Clone)]
pub struct UiStatePersistence {
    store: Arc<dyn UiStateStore>,
    key: String,
}

impl UiStatePersistence {
    pub fn for_owner(store: Arc<dyn UiStateStore>, owner: &OwnerId) -> Self {
        Self {
            store,
            key: format!("ui-state-{owner}"),
        }
    }

    pub async fn rehydrate(&self) -> PartialUiState {
        let raw = match self.store.get(&self.key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return PartialUiState::default(),
            Err(err) => {
                tracing::warn!(error = %err, "ui state unavailable, starting fresh");
                return PartialUiState::default();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "discarding unreadable ui state");
            PartialUiState::default()
        })
    }

    pub async fn persist(&self, state: &PartialUiState) {
        if state == &PartialUiState::default() {
            self.invalidate().await;
            return;
        }
        let Ok(raw) = serde_json::to_string(state) else {
            return;
        };
        if let Err(err) = self.store.set(&self.key, &raw).await {
            tracing::warn!(error = %err, "failed to persist ui state");
        }
    }

    pub async fn invalidate(&self) {
        if let Err(err) = self.store.remove(&self.key).await {
            tracing::warn!(error = %err, "failed to clear ui state");
        }
    }
}
