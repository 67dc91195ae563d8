//! One controller per connected client. It owns the live session, feeds
//! user messages through the store and the responder, and pushes every
//! visible effect out through the [`Notifier`].
//!
//! All mutable state sits behind a single lock that is never held across
//! store or responder calls. Work that outlives a call (responder replies,
//! delayed close effects, the idle timer) is tagged with the generation it
//! was started under; starting or opening another session bumps the
//! generation and aborts pending timers, so late work from a session the
//! user has left is dropped.

use std::{future::Future, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{
    sync::{Mutex, MutexGuard},
    task::JoinHandle,
};

use crate::{
    closure::ClosurePhase,
    config::ControllerConfig,
    counter::{EscalationDecision, SessionCounters},
    error::{ChatError, ChatResult},
    history::HistoryGateway,
    notify::{Notifier, ToastLevel, UiEvent},
    responder::Responder,
    store::ChatStore,
    types::{ChatMessage, OwnerId, Role, Session},
    ui_state::{MessageTimeline, PartialUiState, UiStatePersistence, UiStateStore},
};

pub(crate) struct LiveSession {
    pub(crate) session: Session,
    pub(crate) timeline: MessageTimeline,
    pub(crate) counters: SessionCounters,
    pub(crate) phase: ClosurePhase,
    pub(crate) close_attempt: u64,
    /// Set when a superseded close attempt still got its write through.
    pub(crate) store_closed: bool,
    pub(crate) feedback_target: Option<String>,
}

impl LiveSession {
    fn fresh(session: Session) -> Self {
        Self {
            session,
            timeline: MessageTimeline::default(),
            counters: SessionCounters::default(),
            phase: ClosurePhase::Active,
            close_attempt: 0,
            store_closed: false,
            feedback_target: None,
        }
    }

    fn restored(
        session: Session,
        messages: Vec<ChatMessage>,
        threshold: u32,
        feedback_hint: Option<&str>,
    ) -> Self {
        let timeline = MessageTimeline::replayed(messages);
        let counters = SessionCounters::restored(timeline.user_message_count(), threshold);
        let feedback_target = timeline.feedback_candidate(feedback_hint);
        Self {
            session,
            timeline,
            counters,
            phase: ClosurePhase::Active,
            close_attempt: 0,
            store_closed: false,
            feedback_target,
        }
    }
}

#[derive(Default)]
pub(crate) struct ControllerState {
    pub(crate) generation: u64,
    pub(crate) live: Option<LiveSession>,
    timers: Vec<JoinHandle<()>>,
    idle_timer: Option<JoinHandle<()>>,
}

/// Read-only view of the live session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session: Session,
    pub phase: ClosurePhase,
    pub user_message_count: u32,
    pub escalation_offered: bool,
    pub user_was_satisfied: bool,
    pub feedback_target: Option<String>,
    pub messages: Vec<ChatMessage>,
}

/// A recorded user message whose responder exchange runs in the background.
#[derive(Debug)]
pub struct PendingReply {
    pub message: ChatMessage,
    pub decision: EscalationDecision,
    exchange: JoinHandle<ChatResult<()>>,
}

impl PendingReply {
    /// Waits for the reply to be applied. A cancelled exchange counts as done.
    pub async fn wait(self) -> ChatResult<()> {
        match self.exchange.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => Err(ChatError::InvariantViolation(format!(
                "responder exchange panicked: {err}"
            ))),
        }
    }
}

struct Inner {
    owner: OwnerId,
    config: ControllerConfig,
    store: Arc<dyn ChatStore>,
    responder: Arc<dyn Responder>,
    history: HistoryGateway,
    ui_state: UiStatePersistence,
    notifier: Notifier,
    state: Mutex<ControllerState>,
}

#[derive(Clone)]
pub struct ConversationController {
    inner: Arc<Inner>,
}

impl ConversationController {
    pub fn new(
        owner: OwnerId,
        config: ControllerConfig,
        store: Arc<dyn ChatStore>,
        responder: Arc<dyn Responder>,
        ui_store: Arc<dyn UiStateStore>,
        notifier: Notifier,
    ) -> Self {
        let ui_state = UiStatePersistence::for_owner(ui_store, &owner);
        Self {
            inner: Arc::new(Inner {
                owner,
                config,
                history: HistoryGateway::new(store.clone()),
                store,
                responder,
                ui_state,
                notifier,
                state: Mutex::new(ControllerState::default()),
            }),
        }
    }

    pub fn owner(&self) -> &OwnerId {
        &self.inner.owner
    }

    pub(crate) fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    pub(crate) fn store(&self) -> &Arc<dyn ChatStore> {
        &self.inner.store
    }

    pub(crate) fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    pub(crate) fn ui_state(&self) -> &UiStatePersistence {
        &self.inner.ui_state
    }

    pub(crate) async fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.inner.state.lock().await
    }

    async fn is_current(&self, generation: u64) -> bool {
        self.state().await.generation == generation
    }

    /// Logs the error and shows the user a toast for it.
    pub(crate) fn report(&self, err: &ChatError) {
        match err {
            ChatError::TransientIo(_) => {
                tracing::error!(owner_id = %self.inner.owner, error = %err, "chat operation failed")
            }
            ChatError::Unauthorized(_) | ChatError::InvariantViolation(_) => {
                tracing::warn!(owner_id = %self.inner.owner, error = %err, "chat operation rejected")
            }
            ChatError::NotFound(_) | ChatError::InvalidInput(_) => {
                tracing::debug!(owner_id = %self.inner.owner, error = %err, "chat request refused")
            }
        }
        self.inner.notifier.toast(ToastLevel::Error, err.user_message());
    }

    fn spawn_delayed<F, Fut>(&self, generation: u64, delay: Duration, task: F) -> JoinHandle<()>
    where
        F: FnOnce(ConversationController, u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let controller = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !controller.is_current(generation).await {
                tracing::warn!(owner_id = %controller.owner(), generation, "dropping timer for a superseded session");
                return;
            }
            task(controller, generation).await;
        })
    }

    /// Runs `task` after `delay` unless the session is superseded first.
    /// Schedules nothing and returns false when `generation` is already
    /// stale.
    pub(crate) fn schedule<F, Fut>(
        &self,
        state: &mut ControllerState,
        generation: u64,
        delay: Duration,
        task: F,
    ) -> bool
    where
        F: FnOnce(ConversationController, u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if state.generation != generation {
            tracing::debug!(owner_id = %self.inner.owner, generation, "not scheduling timer for a superseded session");
            return false;
        }
        state.timers.retain(|timer| !timer.is_finished());
        let timer = self.spawn_delayed(generation, delay, task);
        state.timers.push(timer);
        true
    }

    fn arm_idle_timer(&self, state: &mut ControllerState) {
        let idle_after = self.inner.config.idle_close_after;
        if idle_after.is_zero() {
            return;
        }
        if let Some(previous) = state.idle_timer.take() {
            previous.abort();
        }
        state.idle_timer = Some(self.spawn_delayed(
            state.generation,
            idle_after,
            |controller, generation| async move {
                tracing::info!(owner_id = %controller.owner(), "closing idle chat");
                if let Err(err) = controller.close_for_generation(generation, false, false).await {
                    tracing::warn!(error = %err, "idle close failed");
                }
            },
        ));
    }

    fn supersede(&self, state: &mut ControllerState) {
        for timer in state.timers.drain(..) {
            timer.abort();
        }
        if let Some(idle) = state.idle_timer.take() {
            idle.abort();
        }
        state.generation += 1;
        state.live = None;
    }

    pub(crate) async fn persist_ui_state(&self) {
        let hints = {
            let state = self.state().await;
            state
                .live
                .as_ref()
                .filter(|live| live.phase == ClosurePhase::Active)
                .map(|live| PartialUiState {
                    open_session_id: Some(live.session.id.clone()),
                    feedback_target: live.feedback_target.clone(),
                })
                .unwrap_or_default()
        };
        self.inner.ui_state.persist(&hints).await;
    }

    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let state = self.state().await;
        state.live.as_ref().map(|live| SessionSnapshot {
            session: live.session.clone(),
            phase: live.phase,
            user_message_count: live.counters.user_message_count(),
            escalation_offered: live.counters.escalation_offered(),
            user_was_satisfied: live.counters.user_was_satisfied(),
            feedback_target: live.feedback_target.clone(),
            messages: live.timeline.messages().to_vec(),
        })
    }

    /// Creates a session and makes it the live one, dropping whatever was
    /// pending for the previous session.
    pub async fn start_new_session(&self) -> ChatResult<Session> {
        let session = Session::new(self.inner.owner.clone());
        if let Err(err) = self.inner.store.insert_session(&session).await {
            self.report(&err);
            return Err(err);
        }
        {
            let mut state = self.state().await;
            self.supersede(&mut state);
            state.live = Some(LiveSession::fresh(session.clone()));
            self.arm_idle_timer(&mut state);
        }
        tracing::info!(owner_id = %self.inner.owner, session_id = %session.id, "started chat session");
        self.inner.notifier.emit(UiEvent::SessionStarted {
            session: session.clone(),
        });
        self.persist_ui_state().await;
        Ok(session)
    }

    /// Opens a past session. Active sessions become live again; closed
    /// ones are shown read-only.
    pub async fn open_session(&self, session_id: &str) -> ChatResult<Session> {
        match self.inner.history.replay(&self.inner.owner, session_id).await {
            Ok((session, messages)) => Ok(self.install(session, messages, None).await),
            Err(err) => {
                self.report(&err);
                Err(err)
            }
        }
    }

    /// Restores the open chat recorded in the UI hints, if it is still
    /// active. Stale hints are cleared.
    pub async fn rehydrate(&self) -> ChatResult<Option<Session>> {
        let hints = self.inner.ui_state.rehydrate().await;
        let Some(session_id) = hints.open_session_id else {
            return Ok(None);
        };
        match self.inner.history.replay(&self.inner.owner, &session_id).await {
            Ok((session, messages)) if !session.is_closed() => Ok(Some(
                self.install(session, messages, hints.feedback_target.as_deref())
                    .await,
            )),
            Ok(_) | Err(ChatError::NotFound(_)) => {
                tracing::debug!(session_id = %session_id, "dropping stale ui state");
                self.inner.ui_state.invalidate().await;
                Ok(None)
            }
            Err(err) => {
                self.report(&err);
                Err(err)
            }
        }
    }

    async fn install(
        &self,
        session: Session,
        messages: Vec<ChatMessage>,
        feedback_hint: Option<&str>,
    ) -> Session {
        let feedback_target = {
            let mut state = self.state().await;
            self.supersede(&mut state);
            if session.is_closed() {
                None
            } else {
                let live = LiveSession::restored(
                    session.clone(),
                    messages.clone(),
                    self.inner.config.escalation_threshold,
                    feedback_hint,
                );
                let target = live.feedback_target.clone();
                state.live = Some(live);
                self.arm_idle_timer(&mut state);
                target
            }
        };
        tracing::info!(
            owner_id = %self.inner.owner,
            session_id = %session.id,
            messages = messages.len(),
            "opened chat session"
        );
        self.inner.notifier.emit(UiEvent::SessionHistory {
            session: session.clone(),
            messages,
        });
        if !session.is_closed() {
            self.inner.notifier.emit(UiEvent::FeedbackTarget {
                session_id: session.id.clone(),
                message_id: feedback_target,
            });
        }
        self.persist_ui_state().await;
        session
    }

    /// Records the message, counts it, then hands it to the responder in the
    /// background. Starts a session first if none is live.
    pub async fn send_user_message(&self, text: &str) -> ChatResult<PendingReply> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::InvalidInput("Message is empty.".to_string()));
        }

        let needs_session = self.state().await.live.is_none();
        if needs_session {
            self.start_new_session().await?;
        }

        let (generation, session) = {
            let state = self.state().await;
            let Some(live) = state.live.as_ref() else {
                return Err(ChatError::InvariantViolation(
                    "no live session after start".to_string(),
                ));
            };
            if live.phase != ClosurePhase::Active {
                return Err(ChatError::InvalidInput(
                    "This chat is closed. Start a new chat to continue.".to_string(),
                ));
            }
            (state.generation, live.session.clone())
        };

        let message = ChatMessage::new(&session.id, Role::User, text);
        if let Err(err) = self.inner.store.append_message(&message).await {
            self.report(&err);
            return Err(err);
        }

        let (message, decision) = {
            let mut state = self.state().await;
            if state.generation != generation {
                return Err(ChatError::InvalidInput(
                    "This chat is no longer open.".to_string(),
                ));
            }
            let threshold = self.inner.config.escalation_threshold;
            let Some(live) = state.live.as_mut() else {
                return Err(ChatError::InvalidInput(
                    "This chat is no longer open.".to_string(),
                ));
            };
            let message = live.timeline.push_live(message);
            let decision = live.counters.on_user_message(threshold);
            self.arm_idle_timer(&mut state);
            (message, decision)
        };

        self.inner.notifier.emit(UiEvent::MessageNew {
            message: message.clone(),
            escalation_hint: false,
        });
        if let EscalationDecision::Offer { user_message_count } = decision {
            tracing::info!(
                session_id = %session.id,
                user_message_count,
                "offering escalation to human support"
            );
            self.inner.notifier.emit(UiEvent::EscalationOffer {
                session_id: session.id.clone(),
                user_message_count,
            });
        }

        let exchange = {
            let controller = self.clone();
            let content = message.content.clone();
            tokio::spawn(async move { controller.exchange(generation, session, content).await })
        };
        Ok(PendingReply {
            message,
            decision,
            exchange,
        })
    }

    async fn exchange(&self, generation: u64, session: Session, content: String) -> ChatResult<()> {
        let reply = match self
            .inner
            .responder
            .send_user_message(&session, &content)
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                if self.is_current(generation).await {
                    self.report(&err);
                }
                return Err(err);
            }
        };

        if !self.accepts_replies(generation, &session.id).await {
            tracing::debug!(session_id = %session.id, "dropping reply for a session no longer open");
            return Ok(());
        }

        let assistant = ChatMessage::new(&session.id, Role::Assistant, &reply.reply);
        if let Err(err) = self.inner.store.append_message(&assistant).await {
            self.report(&err);
            return Err(err);
        }

        let (message, feedback_target, newly_resolved) = {
            let mut state = self.state().await;
            if state.generation != generation {
                return Ok(());
            }
            let Some(live) = state
                .live
                .as_mut()
                .filter(|live| live.session.id == session.id && live.phase != ClosurePhase::Closed)
            else {
                tracing::debug!(session_id = %session.id, "reply stored after the chat closed");
                return Ok(());
            };
            let message = live.timeline.push_live(assistant);
            let newly_resolved = reply.resolved_hint && live.record_resolution();
            live.feedback_target = live.timeline.feedback_candidate(None);
            // While a close is in flight the controls stay hidden; a failed
            // close shows them again.
            let shown = (live.phase == ClosurePhase::Active).then(|| live.feedback_target.clone());
            (message, shown, newly_resolved)
        };

        if reply.escalation_hint {
            tracing::info!(session_id = %session.id, "responder suggested escalation");
        }
        self.inner.notifier.emit(UiEvent::MessageNew {
            message,
            escalation_hint: reply.escalation_hint,
        });
        if let Some(message_id) = feedback_target {
            self.inner.notifier.emit(UiEvent::FeedbackTarget {
                session_id: session.id.clone(),
                message_id,
            });
        }
        self.persist_ui_state().await;
        if newly_resolved {
            self.persist_resolution(&session.id).await;
        }
        Ok(())
    }

    /// Same owner and backing stores, fresh client connection.
    #[cfg(test)]
    pub(crate) fn reconnect(&self) -> (Self, crate::test_support::EventProbe) {
        let (notifier, rx) = Notifier::channel();
        let controller = Self {
            inner: Arc::new(Inner {
                owner: self.inner.owner.clone(),
                config: self.inner.config.clone(),
                store: self.inner.store.clone(),
                responder: self.inner.responder.clone(),
                history: self.inner.history.clone(),
                ui_state: self.inner.ui_state.clone(),
                notifier,
                state: Mutex::new(ControllerState::default()),
            }),
        };
        (controller, crate::test_support::EventProbe::new(rx))
    }

    async fn accepts_replies(&self, generation: u64, session_id: &str) -> bool {
        let state = self.state().await;
        state.generation == generation
            && state
                .live
                .as_ref()
                .is_some_and(|live| live.session.id == session_id && live.phase != ClosurePhase::Closed)
    }
}
