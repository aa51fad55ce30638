use std::sync::Arc;

use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use time::{Duration, OffsetDateTime};
use tracing::{info, instrument, warn};

use super::repo::{ResetToken, ResetTokenRepository};
use crate::{
    auth::password::{validate_new_password, PasswordCredentialStore},
    error::{AuthError, AuthResult},
    notify::NotificationGateway,
    users::{normalize_email, User, UserRepository},
};

const TOKEN_LEN: usize = 48;

fn generate_token() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Issues and redeems password reset tokens.
pub struct ResetTokenLedger {
    users: Arc<dyn UserRepository>,
    tokens: Arc<dyn ResetTokenRepository>,
    credentials: PasswordCredentialStore,
    notifier: NotificationGateway,
    ttl: Duration,
}

impl ResetTokenLedger {
    pub fn new(
        users: Arc<dyn UserRepository>,
        tokens: Arc<dyn ResetTokenRepository>,
        credentials: PasswordCredentialStore,
        notifier: NotificationGateway,
        ttl_minutes: i64,
    ) -> Self {
        Self {
            users,
            tokens,
            credentials,
            notifier,
            ttl: Duration::minutes(ttl_minutes),
        }
    }

    /// Unknown emails succeed silently so callers cannot probe for accounts.
    #[instrument(skip(self))]
    pub async fn issue(&self, email: &str) -> AuthResult<()> {
        let email = normalize_email(email);
        let Some(user) = self.users.find_by_email(&email).await? else {
            info!("password reset requested for unknown email");
            return Ok(());
        };

        let now = OffsetDateTime::now_utc();
        let token = ResetToken {
            token: generate_token(),
            user_id: user.id,
            expires_at: now + self.ttl,
            created_at: now,
        };
        self.tokens.replace_for_user(&token).await?;
        info!(user_id = %user.id, "password reset token issued");

        self.notifier.send(&user.email, &token.token);
        Ok(())
    }

    #[instrument(skip_all)]
    pub async fn consume(&self, token: &str, new_raw: &str) -> AuthResult<User> {
        // Validate first so a rejected password does not burn the token.
        validate_new_password(new_raw)?;

        let Some(stored) = self.tokens.take(token.trim()).await? else {
            return Err(AuthError::TokenNotFound);
        };
        if stored.is_expired_at(OffsetDateTime::now_utc()) {
            warn!(user_id = %stored.user_id, "expired reset token presented");
            return Err(AuthError::TokenExpired);
        }

        self.credentials.set_password(stored.user_id, new_raw).await?;
        let user = self
            .users
            .find_by_id(stored.user_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("reset token owner {} missing", stored.user_id))?;

        info!(user_id = %user.id, "password reset completed");
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        notify::OutboundMail,
        reset::MemoryResetTokenRepository,
        test_support::RecordingMailer,
        users::MemoryUserRepository,
    };
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        ledger: ResetTokenLedger,
        users: Arc<MemoryUserRepository>,
        tokens: Arc<MemoryResetTokenRepository>,
        credentials: PasswordCredentialStore,
        mail: UnboundedReceiver<OutboundMail>,
    }

    fn fixture() -> Fixture {
        let users = Arc::new(MemoryUserRepository::new());
        let tokens = Arc::new(MemoryResetTokenRepository::new());
        let credentials = PasswordCredentialStore::new(users.clone());
        let (mailer, mail) = RecordingMailer::new();
        let notifier = NotificationGateway::new(Arc::new(mailer), "https://ui.example.com");
        let ledger = ResetTokenLedger::new(
            users.clone(),
            tokens.clone(),
            credentials.clone(),
            notifier,
            15,
        );
        Fixture {
            ledger,
            users,
            tokens,
            credentials,
            mail,
        }
    }

    async fn current_token(fx: &Fixture, user: &User) -> String {
        fx.tokens
            .find_for_user(user.id)
            .await
            .unwrap()
            .expect("live token")
            .token
    }

    #[tokio::test]
    async fn unknown_email_creates_nothing() {
        let mut fx = fixture();
        fx.ledger.issue("ghost@x.com").await.unwrap();
        assert!(fx.tokens.is_empty().await);
        tokio::task::yield_now().await;
        assert!(fx.mail.try_recv().is_err());
    }

    #[tokio::test]
    async fn issue_sends_link_with_token_and_fifteen_minute_ttl() {
        let mut fx = fixture();
        let user = fx.credentials.register("a@x.com", None, "password1").await.unwrap();

        fx.ledger.issue(" A@X.com").await.unwrap();
        let stored = fx.tokens.find_for_user(user.id).await.unwrap().unwrap();
        assert_eq!(stored.token.len(), TOKEN_LEN);
        assert_eq!(stored.expires_at - stored.created_at, Duration::minutes(15));

        let mail = fx.mail.recv().await.unwrap();
        assert_eq!(mail.to, "a@x.com");
        assert!(mail.html.contains(&format!("reset-password?token={}", stored.token)));
    }

    #[tokio::test]
    async fn new_token_invalidates_previous() {
        let fx = fixture();
        let user = fx.credentials.register("a@x.com", None, "password1").await.unwrap();

        fx.ledger.issue("a@x.com").await.unwrap();
        let first = current_token(&fx, &user).await;
        fx.ledger.issue("a@x.com").await.unwrap();
        let second = current_token(&fx, &user).await;
        assert_ne!(first, second);
        assert_eq!(fx.tokens.len().await, 1);

        let err = fx.ledger.consume(&first, "brand-new-1").await.unwrap_err();
        assert!(matches!(err, AuthError::TokenNotFound));
        fx.ledger.consume(&second, "brand-new-1").await.unwrap();
    }

    #[tokio::test]
    async fn token_is_single_use_and_sets_password() {
        let fx = fixture();
        let user = fx.credentials.register("a@x.com", None, "password1").await.unwrap();
        fx.ledger.issue("a@x.com").await.unwrap();
        let token = current_token(&fx, &user).await;

        let reset = fx.ledger.consume(&token, "brand-new-1").await.unwrap();
        assert_eq!(reset.id, user.id);
        let err = fx.ledger.consume(&token, "brand-new-2").await.unwrap_err();
        assert!(matches!(err, AuthError::TokenNotFound));

        assert!(fx.credentials.authenticate("a@x.com", "brand-new-1").await.is_ok());
        assert!(fx.credentials.authenticate("a@x.com", "password1").await.is_err());
    }

    #[tokio::test]
    async fn expired_token_is_rejected_and_removed() {
        let fx = fixture();
        let user = fx.credentials.register("a@x.com", None, "password1").await.unwrap();
        let issued = OffsetDateTime::now_utc() - Duration::minutes(16);
        fx.tokens
            .replace_for_user(&ResetToken {
                token: "stale".into(),
                user_id: user.id,
                expires_at: issued + Duration::minutes(15),
                created_at: issued,
            })
            .await
            .unwrap();

        let err = fx.ledger.consume("stale", "brand-new-1").await.unwrap_err();
        assert!(matches!(err, AuthError::TokenExpired));
        let err = fx.ledger.consume("stale", "brand-new-1").await.unwrap_err();
        assert!(matches!(err, AuthError::TokenNotFound));
        assert!(fx.credentials.authenticate("a@x.com", "password1").await.is_ok());
    }

    #[tokio::test]
    async fn weak_password_keeps_token_alive() {
        let fx = fixture();
        let user = fx.credentials.register("a@x.com", None, "password1").await.unwrap();
        fx.ledger.issue("a@x.com").await.unwrap();
        let token = current_token(&fx, &user).await;

        let err = fx.ledger.consume(&token, "short").await.unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
        fx.ledger.consume(&token, "long-enough").await.unwrap();
    }

    #[tokio::test]
    async fn reset_works_for_federated_account_without_password() {
        let fx = fixture();
        let user = fx
            .users
            .insert_if_absent(crate::users::NewUser {
                email: "fed@x.com".into(),
                name: None,
                password_hash: None,
                provider: crate::users::AuthProvider::Google,
            })
            .await
            .unwrap()
            .unwrap();
        fx.ledger.issue("fed@x.com").await.unwrap();
        let token = current_token(&fx, &user).await;
        fx.ledger.consume(&token, "now-local-1").await.unwrap();
        assert!(fx.credentials.authenticate("fed@x.com", "now-local-1").await.is_ok());
    }
}
