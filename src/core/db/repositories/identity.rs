//! PostgreSQL identity repository
//!
//! Implements [`CredentialStore`] over the `identities` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::core::db::models::{Identity, IdentityId, IdentityUpdate, NewIdentity};
use crate::core::db::store::{CredentialStore, StoreError};

const IDENTITY_COLUMNS: &str = "id, email, password_hash, role, is_active, email_verified, \
     first_name, last_name, api_key_hash, created_at, updated_at, last_activity_at, last_login_at";

/// Identity repository for database operations
#[derive(Clone)]
pub struct IdentityRepository {
    pool: PgPool,
}

impl IdentityRepository {
    /// Create a new identity repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_one(&self, filter: &str, value: &str) -> Result<Option<Identity>, StoreError> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE {filter}");
        let identity = sqlx::query_as::<_, Identity>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;

        Ok(identity)
    }
}

fn map_unique_violation(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            StoreError::EmailAlreadyExists
        }
        other => StoreError::Database(other),
    }
}

#[async_trait]
impl CredentialStore for IdentityRepository {
    async fn find_identity_by_id(&self, id: IdentityId) -> Result<Option<Identity>, StoreError> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = $1");
        let identity = sqlx::query_as::<_, Identity>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(identity)
    }

    async fn find_identity_by_email(&self, email: &str) -> Result<Option<Identity>, StoreError> {
        self.find_one("LOWER(email) = LOWER($1)", email).await
    }

    async fn find_identity_by_api_key(
        &self,
        key_hash: &str,
    ) -> Result<Option<Identity>, StoreError> {
        self.find_one("api_key_hash = $1", key_hash).await
    }

    async fn create_identity(&self, identity: NewIdentity) -> Result<Identity, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO identities (email, password_hash, role, first_name, last_name)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {IDENTITY_COLUMNS}
            "#
        );

        sqlx::query_as::<_, Identity>(&sql)
            .bind(&identity.email)
            .bind(&identity.password_hash)
            .bind(identity.role)
            .bind(&identity.first_name)
            .bind(&identity.last_name)
            .fetch_one(&self.pool)
            .await
            .map_err(map_unique_violation)
    }

    async fn update_identity(
        &self,
        id: IdentityId,
        fields: IdentityUpdate,
    ) -> Result<Option<Identity>, StoreError> {
        let sql = format!(
            r#"
            UPDATE identities
            SET
                email = COALESCE($2, email),
                first_name = COALESCE($3, first_name),
                last_name = COALESCE($4, last_name),
                password_hash = COALESCE($5, password_hash),
                is_active = COALESCE($6, is_active),
                last_login_at = COALESCE($7, last_login_at),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {IDENTITY_COLUMNS}
            "#
        );

        sqlx::query_as::<_, Identity>(&sql)
            .bind(id)
            .bind(&fields.email)
            .bind(&fields.first_name)
            .bind(&fields.last_name)
            .bind(&fields.password_hash)
            .bind(fields.is_active)
            .bind(fields.last_login_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_unique_violation)
    }

    async fn update_last_activity(
        &self,
        id: IdentityId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE identities SET last_activity_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        Ok(())
    }
}
