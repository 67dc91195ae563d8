use crate::{
    closure::ClosurePhase,
    controller::{ConversationController, PendingReply},
    error::{ChatError, ChatResult},
    notify::UiEvent,
    types::{ChatMessage, Role},
};

pub const SATISFIED_ACK: &str = "Yes, I am satisfied with the response.";
pub const NOT_SATISFIED_CONTINUATION: &str =
    "No, I am not satisfied. I need more assistance with my issue.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SatisfactionReply {
    Yes,
    No,
}

impl SatisfactionReply {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "yes" | "true" | "satisfied" => Some(Self::Yes),
            "no" | "false" | "unsatisfied" => Some(Self::No),
            _ => None,
        }
    }
}

/// Whether the user explicitly said they were satisfied. Only the reply
/// handler below writes it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SatisfactionSignal {
    satisfied: bool,
}

impl SatisfactionSignal {
    pub fn was_satisfied(&self) -> bool {
        self.satisfied
    }

    fn record(&mut self, reply: SatisfactionReply) {
        self.satisfied = reply == SatisfactionReply::Yes;
    }
}

impl ConversationController {
    /// Handles a click on the satisfaction controls. "Yes" records the
    /// answer and schedules a forced close; "No" keeps the conversation
    /// going with a continuation message. Once "yes" is recorded, further
    /// replies for the session are ignored.
    pub async fn on_satisfaction_reply(
        &self,
        reply: SatisfactionReply,
    ) -> ChatResult<Option<PendingReply>> {
        let (generation, session_id) = {
            let mut state = self.state().await;
            let generation = state.generation;
            let Some(live) = state.live.as_mut() else {
                return Err(ChatError::InvalidInput("No open chat.".to_string()));
            };
            if live.phase == ClosurePhase::Closed {
                return Err(ChatError::InvalidInput("This chat is already closed.".to_string()));
            }
            if live.counters.user_was_satisfied() {
                tracing::debug!(session_id = %live.session.id, "duplicate satisfaction reply ignored");
                return Ok(None);
            }
            live.counters.satisfaction.record(reply);
            live.feedback_target = None;
            (generation, live.session.id.clone())
        };
        self.notifier().emit(UiEvent::FeedbackTarget {
            session_id: session_id.clone(),
            message_id: None,
        });
        tracing::info!(session_id = %session_id, ?reply, "satisfaction reply");

        match reply {
            SatisfactionReply::Yes => {
                self.acknowledge_satisfied(generation, &session_id).await;
                let delay = self.config().satisfied_close_delay;
                let mut state = self.state().await;
                let scheduled =
                    self.schedule(&mut state, generation, delay, |controller, generation| async move {
                        if let Err(err) = controller.close_for_generation(generation, true, true).await {
                            tracing::warn!(error = %err, "satisfied close failed");
                        }
                    });
                if !scheduled {
                    tracing::info!(session_id = %session_id, "chat left before the satisfied close was scheduled");
                }
                Ok(None)
            }
            SatisfactionReply::No => self
                .send_user_message(NOT_SATISFIED_CONTINUATION)
                .await
                .map(Some),
        }
    }

    /// Shows and stores the acknowledgment. It never reaches the responder
    /// and does not count towards escalation.
    async fn acknowledge_satisfied(&self, generation: u64, session_id: &str) {
        let ack = ChatMessage::new(session_id, Role::User, SATISFIED_ACK);
        if let Err(err) = self.store().append_message(&ack).await {
            tracing::warn!(session_id = %session_id, error = %err, "failed to store satisfaction ack");
        }
        let message = {
            let mut state = self.state().await;
            if state.generation != generation {
                return;
            }
            let Some(live) = state.live.as_mut() else {
                return;
            };
            live.timeline.push_live(ack)
        };
        self.notifier().emit(UiEvent::MessageNew {
            message,
            escalation_hint: false,
        });
        self.persist_ui_state().await;
    }
}
