use anyhow::Context;
use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

/// Single-use password reset capability.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct ResetToken {
    pub token: String,
    pub user_id: Uuid,
    pub expires_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

impl ResetToken {
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }
}

#[async_trait]
pub trait ResetTokenRepository: Send + Sync {
    /// Drops whatever token the user holds and stores `token` in one step.
    async fn replace_for_user(&self, token: &ResetToken) -> anyhow::Result<()>;

    /// Deletes the token and returns it. At most one caller ever gets `Some`.
    async fn take(&self, token: &str) -> anyhow::Result<Option<ResetToken>>;

    async fn find_for_user(&self, user_id: Uuid) -> anyhow::Result<Option<ResetToken>>;
}

#[derive(Clone)]
pub struct PgResetTokenRepository {
    db: PgPool,
}

impl PgResetTokenRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ResetTokenRepository for PgResetTokenRepository {
    async fn replace_for_user(&self, token: &ResetToken) -> anyhow::Result<()> {
        let mut tx = self.db.begin().await.context("begin tx")?;

        // Serialize concurrent requests for the same user on the user row.
        sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(token.user_id)
            .execute(&mut *tx)
            .await
            .context("lock user for reset token")?;

        sqlx::query("DELETE FROM password_reset_tokens WHERE user_id = $1")
            .bind(token.user_id)
            .execute(&mut *tx)
            .await
            .context("delete previous reset tokens")?;

        sqlx::query(
            r#"
            INSERT INTO password_reset_tokens (token, user_id, expires_at, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&token.token)
        .bind(token.user_id)
        .bind(token.expires_at)
        .bind(token.created_at)
        .execute(&mut *tx)
        .await
        .context("insert reset token")?;

        tx.commit().await.context("commit tx")?;
        Ok(())
    }

    async fn take(&self, token: &str) -> anyhow::Result<Option<ResetToken>> {
        let row = sqlx::query_as::<_, ResetToken>(
            r#"
            DELETE FROM password_reset_tokens
             WHERE token = $1
            RETURNING token, user_id, expires_at, created_at
            "#,
        )
        .bind(token)
        .fetch_optional(&self.db)
        .await
        .context("take reset token")?;
        Ok(row)
    }

    async fn find_for_user(&self, user_id: Uuid) -> anyhow::Result<Option<ResetToken>> {
        let row = sqlx::query_as::<_, ResetToken>(
            r#"
            SELECT token, user_id, expires_at, created_at
              FROM password_reset_tokens
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.db)
        .await
        .context("find reset token for user")?;
        Ok(row)
    }
}
