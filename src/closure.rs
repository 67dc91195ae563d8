use serde::Serialize;

use crate::{
    controller::{ConversationController, LiveSession},
    counter::SessionCounters,
    error::ChatResult,
    notify::{ToastLevel, UiEvent},
    types::{now_iso, SessionStatus},
};

pub const CHAT_CLOSED: &str = "Chat closed";
pub const NO_FEEDBACK_NEEDED: &str = "Thank you! No feedback needed.";
pub const HISTORY_ROUTE: &str = "/history";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClosurePhase {
    Active,
    /// A close is waiting on the store. Only a forced close may take over.
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed { show_survey: bool },
    AlreadyClosing,
    AlreadyClosed,
    /// Another close, or another session, took over while this one waited.
    Superseded,
    NoSession,
}

pub fn should_show_survey(resolved: bool, satisfied_flag: bool, user_was_satisfied: bool) -> bool {
    resolved || satisfied_flag || user_was_satisfied
}

impl LiveSession {
    /// Marks the session resolved. Returns true only on the first call; a
    /// resolved session never goes back.
    pub(crate) fn record_resolution(&mut self) -> bool {
        if self.session.resolved {
            return false;
        }
        self.session.resolved = true;
        true
    }
}

impl ConversationController {
    /// Closes the live session. A second close while one is in flight is a
    /// no-op unless `force` is set; a closed session stays closed.
    pub async fn close(&self, satisfied_flag: bool, force: bool) -> ChatResult<CloseOutcome> {
        self.close_inner(None, satisfied_flag, force).await
    }

    /// Close issued by a timer. Does nothing if the session it was armed for
    /// is no longer live.
    pub(crate) async fn close_for_generation(
        &self,
        generation: u64,
        satisfied_flag: bool,
        force: bool,
    ) -> ChatResult<CloseOutcome> {
        self.close_inner(Some(generation), satisfied_flag, force)
            .await
    }

    async fn close_inner(
        &self,
        expected_generation: Option<u64>,
        satisfied_flag: bool,
        force: bool,
    ) -> ChatResult<CloseOutcome> {
        let (generation, attempt, session_id, resolved) = {
            let mut state = self.state().await;
            let generation = state.generation;
            if expected_generation.is_some_and(|expected| expected != generation) {
                return Ok(CloseOutcome::Superseded);
            }
            let Some(live) = state.live.as_mut() else {
                return Ok(CloseOutcome::NoSession);
            };
            match live.phase {
                ClosurePhase::Closed => return Ok(CloseOutcome::AlreadyClosed),
                ClosurePhase::Closing if !force => return Ok(CloseOutcome::AlreadyClosing),
                _ => {}
            }
            live.phase = ClosurePhase::Closing;
            live.close_attempt += 1;
            (
                generation,
                live.close_attempt,
                live.session.id.clone(),
                live.session.resolved,
            )
        };
        tracing::info!(session_id = %session_id, force, satisfied_flag, "closing chat");

        let closed_at = now_iso();
        let written = self
            .store()
            .close_session(&session_id, &closed_at, resolved)
            .await;

        let show_survey = {
            let mut state = self.state().await;
            let current = state.generation == generation;
            let Some(live) = state.live.as_mut().filter(|_| current) else {
                return written.map(|()| CloseOutcome::Superseded);
            };
            let owns = live.close_attempt == attempt && live.phase == ClosurePhase::Closing;
            match written {
                Ok(()) if live.phase == ClosurePhase::Closed => return Ok(CloseOutcome::Superseded),
                Ok(()) if !owns && live.phase == ClosurePhase::Closing => {
                    tracing::debug!(session_id = %session_id, attempt, "close superseded by a later attempt");
                    live.store_closed = true;
                    return Ok(CloseOutcome::Superseded);
                }
                // Ours, or the later attempt failed and rolled back.
                Ok(()) => {}
                Err(err) if !owns => return Err(err),
                Err(err) if !live.store_closed => {
                    live.phase = ClosurePhase::Active;
                    let restored_target = live.feedback_target.clone();
                    drop(state);
                    self.report(&err);
                    self.notifier().emit(UiEvent::FeedbackTarget {
                        session_id,
                        message_id: restored_target,
                    });
                    self.persist_ui_state().await;
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(session_id = %session_id, error = %err, "close write failed but an earlier attempt already closed the chat");
                }
            }

            let show_survey = should_show_survey(
                live.session.resolved,
                satisfied_flag,
                live.counters.user_was_satisfied(),
            );
            live.phase = ClosurePhase::Closed;
            live.session.status = SessionStatus::Closed;
            live.session.closed_at = Some(closed_at);
            live.feedback_target = None;
            live.counters = SessionCounters::default();

            let delay = self.config().close_ux_delay;
            let closed_id = session_id.clone();
            self.schedule(&mut state, generation, delay, move |controller, _| async move {
                controller.finish_close(&closed_id, show_survey);
            });
            show_survey
        };

        tracing::info!(session_id = %session_id, show_survey, "chat closed");
        self.notifier().emit(UiEvent::SessionClosed {
            session_id: session_id.clone(),
            show_survey,
        });
        self.notifier().emit(UiEvent::FeedbackTarget {
            session_id,
            message_id: None,
        });
        self.notifier().toast(ToastLevel::Success, CHAT_CLOSED);
        self.ui_state().invalidate().await;
        Ok(CloseOutcome::Closed { show_survey })
    }

    fn finish_close(&self, session_id: &str, show_survey: bool) {
        if show_survey {
            self.notifier().emit(UiEvent::SurveyShow {
                session_id: session_id.to_string(),
            });
            return;
        }
        self.notifier().toast(ToastLevel::Info, NO_FEEDBACK_NEEDED);
        self.notifier().emit(UiEvent::Navigate {
            to: HISTORY_ROUTE.to_string(),
        });
    }

    /// Best effort. The local flag stays set and the close carries it to the
    /// store anyway.
    pub(crate) async fn persist_resolution(&self, session_id: &str) {
        if let Err(err) = self.store().mark_resolved(session_id).await {
            tracing::warn!(session_id = %session_id, error = %err, "failed to persist resolution");
        } else {
            tracing::info!(session_id = %session_id, "chat marked resolved");
        }
    }
}
