use serde::Serialize;

use crate::{
    controller::{ConversationController, PendingReply},
    error::ChatResult,
    satisfaction::SatisfactionSignal,
};

pub const ESCALATION_REQUEST: &str = "create a ticket";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EscalationDecision {
    None,
    #[serde(rename_all = "camelCase")]
    Offer { user_message_count: u32 },
}

/// Per-session counters. Reset only by creating a new session.
#[derive(Debug, Clone, Default)]
pub struct SessionCounters {
    user_message_count: u32,
    escalation_offered: bool,
    pub(crate) satisfaction: SatisfactionSignal,
}

impl SessionCounters {
    /// Counters for a session reopened from history: an offer is assumed to
    /// have been made already once the threshold was crossed.
    pub fn restored(user_message_count: u32, threshold: u32) -> Self {
        Self {
            user_message_count,
            escalation_offered: user_message_count >= threshold,
            satisfaction: SatisfactionSignal::default(),
        }
    }

    /// Counts one user-authored message that has already been recorded.
    pub fn on_user_message(&mut self, threshold: u32) -> EscalationDecision {
        self.user_message_count += 1;
        if self.user_message_count >= threshold && !self.escalation_offered {
            self.escalation_offered = true;
            return EscalationDecision::Offer {
                user_message_count: self.user_message_count,
            };
        }
        EscalationDecision::None
    }

    pub fn user_message_count(&self) -> u32 {
        self.user_message_count
    }

    pub fn escalation_offered(&self) -> bool {
        self.escalation_offered
    }

    pub fn user_was_satisfied(&self) -> bool {
        self.satisfaction.was_satisfied()
    }
}

impl ConversationController {
    /// The user's answer to an escalation offer. Accepting sends the ticket
    /// request through the normal pipeline; declining changes nothing.
    pub async fn respond_to_escalation(&self, accept: bool) -> ChatResult<Option<PendingReply>> {
        if !accept {
            return Ok(None);
        }
        self.send_user_message(ESCALATION_REQUEST).await.map(Some)
    }
}
