use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};

use crate::{
    error::ChatResult,
    types::{ChatMessage, OwnerId, Role, Session, SessionStatus, SurveyResponse},
};

/// Persistent sessions and messages. Messages are append-only; session
/// updates only ever move a chat towards closed and resolved.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn insert_session(&self, session: &Session) -> ChatResult<()>;
    async fn get_session(&self, session_id: &str) -> ChatResult<Option<Session>>;
    /// Sessions for `owner_id`, newest first.
    async fn list_sessions(&self, owner_id: &OwnerId) -> ChatResult<Vec<Session>>;
    async fn append_message(&self, message: &ChatMessage) -> ChatResult<()>;
    /// Messages of a session, oldest first.
    async fn list_messages(&self, session_id: &str) -> ChatResult<Vec<ChatMessage>>;
    async fn mark_resolved(&self, session_id: &str) -> ChatResult<()>;
    async fn close_session(&self, session_id: &str, closed_at: &str, resolved: bool)
        -> ChatResult<()>;
    /// Stores the first survey for a session. Returns false when the
    /// session already has one.
    async fn insert_survey(&self, survey: &SurveyResponse) -> ChatResult<bool>;
}

#[derive(Clone)]
pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_session_row(row: PgRow) -> Session {
    Session {
        id: row.get("id"),
        owner_id: OwnerId::new(row.get::<String, _>("user_id")),
        status: SessionStatus::parse(
            &row.get::<Option<String>, _>("status").unwrap_or_default(),
        ),
        resolved: row.get("resolved"),
        created_at: row.get("created_at"),
        closed_at: row.get("closed_at"),
    }
}

fn parse_message_row(row: PgRow) -> Option<ChatMessage> {
    let role = Role::parse(&row.get::<String, _>("role"))?;
    Some(ChatMessage {
        id: row.get("id"),
        session_id: row.get("chat_id"),
        role,
        content: row.get("content"),
        created_at: row.get("created_at"),
        skip_replay: false,
    })
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn insert_session(&self, session: &Session) -> ChatResult<()> {
        sqlx::query(
            "INSERT INTO chats (id, user_id, status, resolved, created_at, closed_at) \
             VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(&session.id)
        .bind(session.owner_id.as_str())
        .bind(session.status.as_str())
        .bind(session.resolved)
        .bind(&session.created_at)
        .bind(&session.closed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> ChatResult<Option<Session>> {
        let row = sqlx::query(
            "SELECT id, user_id, status, resolved, created_at, closed_at FROM chats WHERE id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(parse_session_row))
    }

    async fn list_sessions(&self, owner_id: &OwnerId) -> ChatResult<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT id, user_id, status, resolved, created_at, closed_at FROM chats \
             WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(owner_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(parse_session_row).collect())
    }

    async fn append_message(&self, message: &ChatMessage) -> ChatResult<()> {
        sqlx::query(
            "INSERT INTO messages (id, chat_id, role, content, created_at) VALUES ($1,$2,$3,$4,$5) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(&message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> ChatResult<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT id, chat_id, role, content, created_at FROM messages \
             WHERE chat_id = $1 ORDER BY created_at ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().filter_map(parse_message_row).collect())
    }

    async fn mark_resolved(&self, session_id: &str) -> ChatResult<()> {
        sqlx::query("UPDATE chats SET resolved = true WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close_session(
        &self,
        session_id: &str,
        closed_at: &str,
        resolved: bool,
    ) -> ChatResult<()> {
        sqlx::query(
            "UPDATE chats \
             SET status = 'closed', \
                 closed_at = COALESCE(closed_at, $2), \
                 resolved = resolved OR $3 \
             WHERE id = $1",
        )
        .bind(session_id)
        .bind(closed_at)
        .bind(resolved)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_survey(&self, survey: &SurveyResponse) -> ChatResult<bool> {
        let result = sqlx::query(
            "INSERT INTO chat_surveys (id, chat_id, user_id, score, comment, submitted_at) \
             VALUES ($1,$2,$3,$4,$5,$6) \
             ON CONFLICT (chat_id) DO NOTHING",
        )
        .bind(&survey.id)
        .bind(&survey.session_id)
        .bind(survey.owner_id.as_str())
        .bind(survey.score)
        .bind(&survey.comment)
        .bind(&survey.submitted_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
