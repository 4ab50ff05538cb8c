//! Session repository for refresh token management
//!
//! Implements [`SessionStore`] over the `sessions` table. Rows are keyed by
//! the SHA-256 digest of the refresh token; the raw token is never written.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::core::db::models::{IdentityId, NewSession, SessionRecord};
use crate::core::db::store::{SessionStore, StoreError};

const SESSION_COLUMNS: &str =
    "id, identity_id, token_hash, expires_at, ip_address, user_agent, created_at";

/// Session repository for database operations
#[derive(Clone)]
pub struct SessionRepository {
    pool: PgPool,
}

impl SessionRepository {
    /// Create a new session repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn insert_sql() -> String {
        format!(
            r#"
            INSERT INTO sessions (identity_id, token_hash, expires_at, ip_address, user_agent, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {SESSION_COLUMNS}
            "#
        )
    }
}

#[async_trait]
impl SessionStore for SessionRepository {
    async fn create_session(&self, session: NewSession) -> Result<SessionRecord, StoreError> {
        let record = sqlx::query_as::<_, SessionRecord>(&Self::insert_sql())
            .bind(session.identity_id)
            .bind(&session.token_hash)
            .bind(session.expires_at)
            .bind(&session.ip_address)
            .bind(&session.user_agent)
            .bind(session.created_at)
            .fetch_one(&self.pool)
            .await?;

        Ok(record)
    }

    async fn find_session_by_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE token_hash = $1");
        let record = sqlx::query_as::<_, SessionRecord>(&sql)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn delete_session(&self, token_hash: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE token_hash = $1")
            .bind(token_hash)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_all_sessions_for_identity(&self, id: IdentityId) -> Result<u64, StoreError> {
        // Single statement: all-or-nothing per identity
        let result = sqlx::query("DELETE FROM sessions WHERE identity_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn delete_other_sessions(
        &self,
        id: IdentityId,
        keep_hash: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE identity_id = $1 AND token_hash <> $2")
            .bind(id)
            .bind(keep_hash)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn rotate_session(
        &self,
        old_hash: &str,
        replacement: NewSession,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM sessions WHERE token_hash = $1")
            .bind(old_hash)
            .execute(&mut *tx)
            .await?;

        // Lost a race with logout or another refresh
        if deleted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let record = sqlx::query_as::<_, SessionRecord>(&Self::insert_sql())
            .bind(replacement.identity_id)
            .bind(&replacement.token_hash)
            .bind(replacement.expires_at)
            .bind(&replacement.ip_address)
            .bind(&replacement.user_agent)
            .bind(replacement.created_at)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(record))
    }

    async fn list_sessions_for_identity(
        &self,
        id: IdentityId,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE identity_id = $1 ORDER BY created_at DESC"
        );
        let records = sqlx::query_as::<_, SessionRecord>(&sql)
            .bind(id)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
