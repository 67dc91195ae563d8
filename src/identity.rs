//! Turns an authenticated principal into the verified owner id that scopes
//! every history query. Resolution never fabricates an identifier: when
//! neither the token claim nor the directory lookups verify, it fails closed.

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{
    error::{ChatError, ChatResult},
    types::{OwnerId, Principal},
};

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn owner_exists(&self, owner_id: &str) -> ChatResult<bool>;
    async fn find_by_email(&self, email: &str) -> ChatResult<Option<String>>;
    async fn find_by_username(&self, username: &str) -> ChatResult<Option<String>>;
}

#[async_trait]
pub trait PrincipalProvider: Send + Sync {
    async fn principal_for_token(&self, token: &str) -> ChatResult<Principal>;
}

fn normalize_email(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

fn non_blank(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn verified_format(candidate: String) -> ChatResult<OwnerId> {
    if Uuid::parse_str(&candidate).is_err() {
        tracing::warn!("directory returned an owner id that is not a uuid");
        return Err(ChatError::Unauthorized(
            "owner id has an invalid format".to_string(),
        ));
    }
    Ok(OwnerId::new(candidate))
}

pub async fn resolve_owner_id(
    principal: &Principal,
    directory: &dyn UserDirectory,
) -> ChatResult<OwnerId> {
    if let Some(claim) = non_blank(principal.owner_id_claim.as_ref()) {
        if directory.owner_exists(claim).await? {
            return verified_format(claim.to_string());
        }
        tracing::warn!("owner claim in token is not present in the user directory");
    }

    if let Some(email) = non_blank(principal.email.as_ref()) {
        if let Some(id) = directory.find_by_email(&normalize_email(email)).await? {
            return verified_format(id);
        }
    }

    if let Some(username) = non_blank(principal.username.as_ref()) {
        if let Some(id) = directory.find_by_username(username).await? {
            return verified_format(id);
        }
    }

    Err(ChatError::Unauthorized(
        "no verifiable owner for the authenticated principal".to_string(),
    ))
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

pub async fn authenticate(
    token: Option<&str>,
    principals: &dyn PrincipalProvider,
    directory: &dyn UserDirectory,
) -> ChatResult<OwnerId> {
    let token = token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ChatError::Unauthorized("missing bearer token".to_string()))?;
    let principal = principals.principal_for_token(token).await?;
    resolve_owner_id(&principal, directory).await
}

/// Postgres-backed user directory and token table.
#[derive(Clone)]
pub struct PgIdentity {
    pool: PgPool,
}

impl PgIdentity {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgIdentity {
    async fn owner_exists(&self, owner_id: &str) -> ChatResult<bool> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM users WHERE id = $1")
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn find_by_email(&self, email: &str) -> ChatResult<Option<String>> {
        let id = sqlx::query_scalar::<_, String>("SELECT id FROM users WHERE lower(email) = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    async fn find_by_username(&self, username: &str) -> ChatResult<Option<String>> {
        let id = sqlx::query_scalar::<_, String>("SELECT id FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }
}

#[async_trait]
impl PrincipalProvider for PgIdentity {
    async fn principal_for_token(&self, token: &str) -> ChatResult<Principal> {
        let row = sqlx::query(
            "SELECT username, email, user_id, expires_at FROM auth_tokens WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ChatError::Unauthorized("invalid token".to_string()))?;

        let expires_at: Option<String> = row.get("expires_at");
        let expired = expires_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc) <= Utc::now())
            .unwrap_or(false);
        if expired {
            return Err(ChatError::Unauthorized("token expired".to_string()));
        }

        Ok(Principal {
            username: row.get("username"),
            email: row.get("email"),
            owner_id_claim: row.get("user_id"),
        })
    }
}
