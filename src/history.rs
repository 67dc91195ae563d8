use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Months, Utc};
use serde::Serialize;

use crate::{
    error::{ChatError, ChatResult},
    store::ChatStore,
    types::{ChatMessage, HistoryParams, OwnerId, Session, SessionSummary},
    ui_state::mark_replayed,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DateRange {
    #[default]
    All,
    Today,
    Week,
    Month,
}

impl DateRange {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "today" => DateRange::Today,
            "week" => DateRange::Week,
            "month" => DateRange::Month,
            _ => DateRange::All,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Newest,
    Oldest,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub search: String,
    pub range: DateRange,
    pub sort: SortOrder,
}

impl From<&HistoryParams> for HistoryQuery {
    fn from(params: &HistoryParams) -> Self {
        Self {
            search: params.search.clone().unwrap_or_default().trim().to_string(),
            range: params
                .range
                .as_deref()
                .map(DateRange::parse)
                .unwrap_or_default(),
            sort: match params.sort.as_deref().map(str::trim) {
                Some("oldest") => SortOrder::Oldest,
                _ => SortOrder::Newest,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub total: usize,
    pub today: usize,
    pub this_week: usize,
    pub filtered: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub sessions: Vec<SessionSummary>,
    pub stats: HistoryStats,
}

fn created_at_utc(session: &Session) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&session.created_at)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

fn within_range(session: &Session, range: DateRange, now: DateTime<Utc>) -> bool {
    let Some(created) = created_at_utc(session) else {
        return range == DateRange::All;
    };
    match range {
        DateRange::All => true,
        DateRange::Today => created.date_naive() == now.date_naive(),
        DateRange::Week => created >= now - ChronoDuration::days(7),
        DateRange::Month => now
            .checked_sub_months(Months::new(1))
            .map(|cutoff| created >= cutoff)
            .unwrap_or(true),
    }
}

fn matches_search(session: &Session, search: &str) -> bool {
    if search.is_empty() {
        return true;
    }
    let needle = search.to_lowercase();
    session.id.to_lowercase().contains(&needle)
        || session.created_at.to_lowercase().contains(&needle)
}

/// Filters and sorts already ownership-checked sessions.
pub fn browse_sessions(sessions: &[Session], query: &HistoryQuery, now: DateTime<Utc>) -> HistoryPage {
    let mut filtered = sessions
        .iter()
        .filter(|s| matches_search(s, &query.search))
        .filter(|s| within_range(s, query.range, now))
        .collect::<Vec<_>>();

    filtered.sort_by(|a, b| {
        let order = created_at_utc(a).cmp(&created_at_utc(b));
        match query.sort {
            SortOrder::Newest => order.reverse(),
            SortOrder::Oldest => order,
        }
    });

    let stats = HistoryStats {
        total: sessions.len(),
        today: sessions
            .iter()
            .filter(|s| within_range(s, DateRange::Today, now))
            .count(),
        this_week: sessions
            .iter()
            .filter(|s| within_range(s, DateRange::Week, now))
            .count(),
        filtered: filtered.len(),
    };

    HistoryPage {
        sessions: filtered.into_iter().map(SessionSummary::from).collect(),
        stats,
    }
}

/// Read-only access to a user's past sessions.
#[derive(Clone)]
pub struct HistoryGateway {
    store: Arc<dyn ChatStore>,
}

impl HistoryGateway {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    /// Sessions owned by `owner`, newest first. Rows the store returns for
    /// any other owner are dropped and reported.
    pub async fn list_sessions(&self, owner: &OwnerId) -> ChatResult<Vec<Session>> {
        let rows = self.store.list_sessions(owner).await?;
        let total = rows.len();
        let verified = rows
            .into_iter()
            .filter(|session| {
                if &session.owner_id == owner {
                    return true;
                }
                let violation = ChatError::InvariantViolation(format!(
                    "session {} returned for a different owner",
                    session.id
                ));
                tracing::warn!(
                    owner_id = %owner,
                    session_id = %session.id,
                    error = %violation,
                    "security anomaly: discarding foreign session from history query"
                );
                false
            })
            .collect::<Vec<_>>();
        if verified.len() != total {
            tracing::warn!(
                owner_id = %owner,
                returned = total,
                kept = verified.len(),
                "history query over-returned rows"
            );
        }
        Ok(verified)
    }

    /// A single owned session. A session owned by someone else is reported
    /// as not found so its existence is not revealed.
    pub async fn get_session(&self, owner: &OwnerId, session_id: &str) -> ChatResult<Session> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("session {session_id}")))?;
        if &session.owner_id != owner {
            tracing::warn!(
                owner_id = %owner,
                session_id = %session_id,
                "security anomaly: session requested by a non-owner"
            );
            return Err(ChatError::NotFound(format!("session {session_id}")));
        }
        Ok(session)
    }

    pub async fn browse(
        &self,
        owner: &OwnerId,
        query: &HistoryQuery,
        now: DateTime<Utc>,
    ) -> ChatResult<HistoryPage> {
        let sessions = self.list_sessions(owner).await?;
        Ok(browse_sessions(&sessions, query, now))
    }

    /// Owned session plus its messages, all marked as replayed.
    pub async fn replay(
        &self,
        owner: &OwnerId,
        session_id: &str,
    ) -> ChatResult<(Session, Vec<ChatMessage>)> {
        let session = self.get_session(owner, session_id).await?;
        let mut messages = self.store.list_messages(&session.id).await?;
        messages.retain(|m| m.session_id == session.id);
        mark_replayed(&mut messages);
        Ok((session, messages))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test_support::{owner, session_at, MemoryChatStore, ALICE, BOB};
    use crate::types::Role;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn misconfigured_store_never_leaks_other_owners() {
        let store = Arc::new(MemoryChatStore::default().over_returning());
        store.seed_session(session_at("a1", ALICE, "2026-03-15T10:00:00Z"));
        store.seed_session(session_at("b1", BOB, "2026-03-15T11:00:00Z"));
        store.seed_session(session_at("a2", ALICE, "2026-03-14T10:00:00Z"));

        let gateway = HistoryGateway::new(store);
        let sessions = gateway.list_sessions(&owner(ALICE)).await.unwrap();

        assert!(sessions.iter().all(|s| s.owner_id == owner(ALICE)));
        assert_eq!(
            sessions.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["a1", "a2"]
        );
    }

    #[tokio::test]
    async fn empty_history_is_not_an_error() {
        let gateway = HistoryGateway::new(Arc::new(MemoryChatStore::default()));
        let sessions = gateway.list_sessions(&owner(ALICE)).await.unwrap();
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn foreign_session_reads_as_not_found() {
        let store = Arc::new(MemoryChatStore::default());
        store.seed_session(session_at("b1", BOB, "2026-03-15T11:00:00Z"));
        let gateway = HistoryGateway::new(store);

        let err = gateway.get_session(&owner(ALICE), "b1").await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
        let missing = gateway.get_session(&owner(ALICE), "zz").await.unwrap_err();
        assert!(matches!(missing, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn replay_marks_every_message_to_skip_animation() {
        let store = Arc::new(MemoryChatStore::default());
        store.seed_session(session_at("a1", ALICE, "2026-03-15T10:00:00Z"));
        store.seed_message("a1", Role::User, "printer is on fire");
        store.seed_message("a1", Role::Assistant, "please step away from the printer");
        let gateway = HistoryGateway::new(store);

        let (session, messages) = gateway.replay(&owner(ALICE), "a1").await.unwrap();
        assert_eq!(session.id, "a1");
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.skip_replay));
    }

    #[tokio::test]
    async fn store_outage_surfaces_as_transient() {
        let store = Arc::new(MemoryChatStore::default());
        store.fail_reads(true);
        let gateway = HistoryGateway::new(store);
        let err = gateway.list_sessions(&owner(ALICE)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn browse_filters_by_range_and_sorts() {
        let sessions = vec![
            session_at("today-early", ALICE, "2026-03-15T08:00:00Z"),
            session_at("today-late", ALICE, "2026-03-15T11:00:00Z"),
            session_at("five-days", ALICE, "2026-03-10T09:00:00Z"),
            session_at("three-weeks", ALICE, "2026-02-22T09:00:00Z"),
            session_at("old", ALICE, "2025-12-01T09:00:00Z"),
        ];

        let today = browse_sessions(
            &sessions,
            &HistoryQuery {
                range: DateRange::Today,
                sort: SortOrder::Oldest,
                ..HistoryQuery::default()
            },
            now(),
        );
        assert_eq!(
            today.sessions.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["today-early", "today-late"]
        );

        let month = browse_sessions(
            &sessions,
            &HistoryQuery {
                range: DateRange::Month,
                ..HistoryQuery::default()
            },
            now(),
        );
        assert_eq!(
            month.sessions.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["today-late", "today-early", "five-days", "three-weeks"]
        );

        assert_eq!(
            month.stats,
            HistoryStats {
                total: 5,
                today: 2,
                this_week: 3,
                filtered: 4,
            }
        );
    }

    #[test]
    fn browse_search_matches_id_case_insensitively() {
        let sessions = vec![
            session_at("abc-123", ALICE, "2026-03-15T08:00:00Z"),
            session_at("def-456", ALICE, "2026-03-15T09:00:00Z"),
        ];
        let page = browse_sessions(
            &sessions,
            &HistoryQuery {
                search: "ABC".to_string(),
                ..HistoryQuery::default()
            },
            now(),
        );
        assert_eq!(page.sessions.len(), 1);
        assert_eq!(page.sessions[0].title, "Mission ABC-123");
    }

    #[test]
    fn query_params_default_to_all_newest() {
        let query = HistoryQuery::from(&HistoryParams {
            search: None,
            range: Some("fortnight".to_string()),
            sort: None,
        });
        assert_eq!(query.range, DateRange::All);
        assert_eq!(query.sort, SortOrder::Newest);
    }
}
