use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::{
    config::ControllerConfig,
    controller::ConversationController,
    error::{ChatError, ChatResult},
    identity::{PrincipalProvider, UserDirectory},
    notify::{Notifier, UiEvent},
    responder::Responder,
    store::ChatStore,
    types::{
        ChatMessage, OwnerId, Principal, ResponderReply, Role, Session, SessionStatus,
        SurveyResponse,
    },
    ui_state::MemoryUiStateStore,
};

pub const ALICE: &str = "0b6c8a52-3f1e-4d7a-9c55-6f2d1e8a4b01";
pub const BOB: &str = "7e41d0c3-52a9-4b8e-8f10-c9a3b27e6d02";

pub fn owner(id: &str) -> OwnerId {
    OwnerId::new(id)
}

pub fn session_at(id: &str, owner_id: &str, created_at: &str) -> Session {
    Session {
        id: id.to_string(),
        owner_id: owner(owner_id),
        status: SessionStatus::Active,
        resolved: false,
        created_at: created_at.to_string(),
        closed_at: None,
    }
}

/// Held shut until released; waiters see the release even if they arrive late.
pub struct Gate {
    tx: watch::Sender<bool>,
}

impl Gate {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    pub fn release(&self) {
        let _ = self.tx.send(true);
    }
}

async fn pass(gate: Option<watch::Receiver<bool>>) {
    if let Some(mut rx) = gate {
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[derive(Default)]
struct Tables {
    sessions: Vec<Session>,
    messages: Vec<ChatMessage>,
    surveys: Vec<SurveyResponse>,
}

#[derive(Default)]
pub struct MemoryChatStore {
    tables: Mutex<Tables>,
    over_return: bool,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    close_gate: Mutex<Option<watch::Receiver<bool>>>,
    waiting_closes: AtomicUsize,
    append_gate: Mutex<Option<watch::Receiver<bool>>>,
    waiting_appends: AtomicUsize,
}

impl MemoryChatStore {
    /// Ignores the owner filter on listing, like a misconfigured query.
    pub fn over_returning(mut self) -> Self {
        self.over_return = true;
        self
    }

    pub fn seed_session(&self, session: Session) {
        self.tables.lock().unwrap().sessions.push(session);
    }

    pub fn seed_message(&self, session_id: &str, role: Role, content: &str) {
        self.tables
            .lock()
            .unwrap()
            .messages
            .push(ChatMessage::new(session_id, role, content));
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every close blocks until the returned gate is released. Whether it
    /// fails is decided when the close arrives, not when it is let through.
    pub fn gate_closes(&self) -> Gate {
        let (gate, rx) = Gate::new();
        *self.close_gate.lock().unwrap() = Some(rx);
        gate
    }

    pub fn waiting_closes(&self) -> usize {
        self.waiting_closes.load(Ordering::SeqCst)
    }

    /// Every message append blocks until the returned gate is released.
    pub fn gate_appends(&self) -> Gate {
        let (gate, rx) = Gate::new();
        *self.append_gate.lock().unwrap() = Some(rx);
        gate
    }

    pub fn waiting_appends(&self) -> usize {
        self.waiting_appends.load(Ordering::SeqCst)
    }

    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.tables
            .lock()
            .unwrap()
            .sessions
            .iter()
            .find(|s| s.id == session_id)
            .cloned()
    }

    pub fn messages(&self, session_id: &str) -> Vec<ChatMessage> {
        self.tables
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn surveys(&self) -> Vec<SurveyResponse> {
        self.tables.lock().unwrap().surveys.clone()
    }

    fn check_read(&self) -> ChatResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ChatError::TransientIo("store: connection refused".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> ChatResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ChatError::TransientIo("store: connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn insert_session(&self, session: &Session) -> ChatResult<()> {
        self.check_write()?;
        self.tables.lock().unwrap().sessions.push(session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> ChatResult<Option<Session>> {
        self.check_read()?;
        Ok(self.session(session_id))
    }

    async fn list_sessions(&self, owner_id: &OwnerId) -> ChatResult<Vec<Session>> {
        self.check_read()?;
        let mut sessions = self
            .tables
            .lock()
            .unwrap()
            .sessions
            .iter()
            .filter(|s| self.over_return || &s.owner_id == owner_id)
            .cloned()
            .collect::<Vec<_>>();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn append_message(&self, message: &ChatMessage) -> ChatResult<()> {
        let gate = self.append_gate.lock().unwrap().clone();
        self.waiting_appends.fetch_add(1, Ordering::SeqCst);
        pass(gate).await;
        self.waiting_appends.fetch_sub(1, Ordering::SeqCst);
        self.check_write()?;
        let mut stored = message.clone();
        stored.skip_replay = false;
        self.tables.lock().unwrap().messages.push(stored);
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> ChatResult<Vec<ChatMessage>> {
        self.check_read()?;
        Ok(self.messages(session_id))
    }

    async fn mark_resolved(&self, session_id: &str) -> ChatResult<()> {
        self.check_write()?;
        let mut tables = self.tables.lock().unwrap();
        if let Some(session) = tables.sessions.iter_mut().find(|s| s.id == session_id) {
            session.resolved = true;
        }
        Ok(())
    }

    async fn close_session(
        &self,
        session_id: &str,
        closed_at: &str,
        resolved: bool,
    ) -> ChatResult<()> {
        let written = self.check_write();
        let gate = self.close_gate.lock().unwrap().clone();
        self.waiting_closes.fetch_add(1, Ordering::SeqCst);
        pass(gate).await;
        self.waiting_closes.fetch_sub(1, Ordering::SeqCst);
        written?;

        let mut tables = self.tables.lock().unwrap();
        if let Some(session) = tables.sessions.iter_mut().find(|s| s.id == session_id) {
            session.status = SessionStatus::Closed;
            session.closed_at.get_or_insert_with(|| closed_at.to_string());
            session.resolved |= resolved;
        }
        Ok(())
    }

    async fn insert_survey(&self, survey: &SurveyResponse) -> ChatResult<bool> {
        self.check_write()?;
        let mut tables = self.tables.lock().unwrap();
        if tables
            .surveys
            .iter()
            .any(|s| s.session_id == survey.session_id)
        {
            return Ok(false);
        }
        tables.surveys.push(survey.clone());
        Ok(true)
    }
}

#[derive(Default)]
pub struct MemoryDirectory {
    users: Vec<(String, String, String)>,
    failing: bool,
    principals: Vec<(String, Principal)>,
}

impl MemoryDirectory {
    pub fn with_user(mut self, id: &str, email: &str, username: &str) -> Self {
        self.users
            .push((id.to_string(), email.to_string(), username.to_string()));
        self
    }

    pub fn with_token(mut self, token: &str, principal: Principal) -> Self {
        self.principals.push((token.to_string(), principal));
        self
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    fn check(&self) -> ChatResult<()> {
        if self.failing {
            return Err(ChatError::TransientIo("directory: timed out".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn owner_exists(&self, owner_id: &str) -> ChatResult<bool> {
        self.check()?;
        Ok(self.users.iter().any(|(id, _, _)| id == owner_id))
    }

    async fn find_by_email(&self, email: &str) -> ChatResult<Option<String>> {
        self.check()?;
        Ok(self
            .users
            .iter()
            .find(|(_, known, _)| known.eq_ignore_ascii_case(email))
            .map(|(id, _, _)| id.clone()))
    }

    async fn find_by_username(&self, username: &str) -> ChatResult<Option<String>> {
        self.check()?;
        Ok(self
            .users
            .iter()
            .find(|(_, _, known)| known == username)
            .map(|(id, _, _)| id.clone()))
    }
}

#[async_trait]
impl PrincipalProvider for MemoryDirectory {
    async fn principal_for_token(&self, token: &str) -> ChatResult<Principal> {
        self.check()?;
        self.principals
            .iter()
            .find(|(known, _)| known == token)
            .map(|(_, principal)| principal.clone())
            .ok_or_else(|| ChatError::Unauthorized("unknown token".to_string()))
    }
}

/// Replies from a queue, falling back to a canned answer.
#[derive(Default)]
pub struct ScriptedResponder {
    queued: Mutex<VecDeque<ResponderReply>>,
    received: Mutex<Vec<String>>,
    fail_next: AtomicBool,
    hold: Mutex<Option<watch::Receiver<bool>>>,
}

impl ScriptedResponder {
    pub fn queue(&self, reply: ResponderReply) {
        self.queued.lock().unwrap().push_back(reply);
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Replies wait until the returned gate is released.
    pub fn hold_replies(&self) -> Gate {
        let (gate, rx) = Gate::new();
        *self.hold.lock().unwrap() = Some(rx);
        gate
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl Responder for ScriptedResponder {
    async fn send_user_message(
        &self,
        _session: &Session,
        content: &str,
    ) -> ChatResult<ResponderReply> {
        self.received.lock().unwrap().push(content.to_string());
        let hold = self.hold.lock().unwrap().clone();
        pass(hold).await;
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ChatError::TransientIo("responder: 502 Bad Gateway".to_string()));
        }
        let reply = self.queued.lock().unwrap().pop_front();
        Ok(reply.unwrap_or_else(|| ResponderReply {
            reply: "Let me look into that for you.".to_string(),
            resolved_hint: false,
            escalation_hint: false,
        }))
    }
}

/// Collects the events a controller pushed to its client.
pub struct EventProbe {
    rx: mpsc::UnboundedReceiver<UiEvent>,
}

impl EventProbe {
    pub fn new(rx: mpsc::UnboundedReceiver<UiEvent>) -> Self {
        Self { rx }
    }

    pub fn drain(&mut self) -> Vec<UiEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            seen.push(event);
        }
        seen
    }
}

pub struct Harness {
    pub controller: ConversationController,
    pub events: EventProbe,
    pub store: Arc<MemoryChatStore>,
    pub responder: Arc<ScriptedResponder>,
}

pub fn harness() -> Harness {
    harness_with(ControllerConfig::default())
}

pub fn harness_with(config: ControllerConfig) -> Harness {
    let store = Arc::new(MemoryChatStore::default());
    let responder = Arc::new(ScriptedResponder::default());
    let (notifier, rx) = Notifier::channel();
    let controller = ConversationController::new(
        owner(ALICE),
        config,
        store.clone(),
        responder.clone(),
        Arc::new(MemoryUiStateStore::default()),
        notifier,
    );
    Harness {
        controller,
        events: EventProbe::new(rx),
        store,
        responder,
    }
}
