use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, instrument};

use super::providers::{self, NormalizedIdentity, ProviderSpec};
use crate::{
    auth::tokens::TokenService,
    config::ui_link,
    error::{AuthError, AuthResult},
    profile::ProfileImageCoordinator,
    users::{normalize_email, NewUser, User, UserRepository},
};

/// Reconciles a federated identity with the local user table.
pub struct IdentityLinker {
    users: Arc<dyn UserRepository>,
    tokens: TokenService,
    profiles: Arc<ProfileImageCoordinator>,
    ui_url: String,
}

impl IdentityLinker {
    pub fn new(
        users: Arc<dyn UserRepository>,
        tokens: TokenService,
        profiles: Arc<ProfileImageCoordinator>,
        ui_url: &str,
    ) -> Self {
        Self {
            users,
            tokens,
            profiles,
            ui_url: ui_url.trim_end_matches('/').to_string(),
        }
    }

    /// Finds or creates the user behind `attributes` and issues a session token.
    #[instrument(skip(self, attributes))]
    pub async fn resolve(&self, provider_name: &str, attributes: &Value) -> AuthResult<(User, String)> {
        let spec = providers::find(provider_name)
            .ok_or_else(|| AuthError::Validation(format!("Unsupported provider: {provider_name}")))?;
        let identity = (spec.extract)(attributes).ok_or_else(|| {
            AuthError::Validation(format!("{} did not supply an email address", spec.name))
        })?;

        let user = self.find_or_create(spec, &identity).await?;
        let user = self.refresh(user, &identity).await?;

        let token = self.tokens.issue(&user.email)?;
        info!(user_id = %user.id, provider = spec.name, "federated login");
        Ok((user, token))
    }

    pub fn callback_redirect(&self, token: &str) -> String {
        ui_link(&self.ui_url, "/login-success", token)
    }

    async fn find_or_create(
        &self,
        spec: &ProviderSpec,
        identity: &NormalizedIdentity,
    ) -> AuthResult<User> {
        let email = normalize_email(&identity.email);
        if let Some(user) = self.users.find_by_email(&email).await? {
            return Ok(user);
        }

        let created = self
            .users
            .insert_if_absent(NewUser {
                email: email.clone(),
                name: identity.name.clone(),
                password_hash: None,
                provider: spec.provider,
            })
            .await?;
        match created {
            Some(user) => {
                info!(user_id = %user.id, provider = %spec.provider, "user created from federated login");
                Ok(user)
            }
            // Lost a concurrent first login for the same email.
            None => self
                .users
                .find_by_email(&email)
                .await?
                .ok_or_else(|| anyhow::anyhow!("user {email} vanished after insert conflict").into()),
        }
    }

    /// Refreshes the display name and backfills a missing image.
    async fn refresh(&self, user: User, identity: &NormalizedIdentity) -> AuthResult<User> {
        let name_differs = identity.name.is_some() && identity.name != user.name;
        let needs_image = user.image_url.as_deref().unwrap_or_default().is_empty()
            && identity.image_url.is_some();
        if !name_differs && !needs_image {
            return Ok(user);
        }

        let Some(update) = self.users.begin_update(user.id).await? else {
            return Ok(user);
        };
        let current = update.user().clone();
        let mut changed = current.clone();
        if identity.name.is_some() && identity.name != current.name {
            changed.name = identity.name.clone();
        }

        if current.image_url.as_deref().unwrap_or_default().is_empty() {
            if let Some(remote) = &identity.image_url {
                match self.profiles.import_remote_image(current.id, remote).await {
                    Ok(url) => changed.image_url = Some(url),
                    Err(e) => error!(user_id = %current.id, error = %e, "failed to sync social image"),
                }
            }
        }

        if changed == current {
            return Ok(current);
        }
        Ok(update.commit(&changed).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AppConfig,
        storage::MemoryObjectStore,
        test_support::StubImageSource,
        users::{AuthProvider, MemoryUserRepository},
    };
    use serde_json::json;

    struct Fixture {
        linker: Arc<IdentityLinker>,
        users: Arc<MemoryUserRepository>,
        fetcher: Arc<StubImageSource>,
        tokens: TokenService,
    }

    fn fixture() -> Fixture {
        let cfg = AppConfig::for_tests();
        let users = Arc::new(MemoryUserRepository::new());
        let fetcher = Arc::new(StubImageSource::png());
        let profiles = Arc::new(ProfileImageCoordinator::new(
            users.clone(),
            Arc::new(MemoryObjectStore::new(cfg.storage.public_url.clone())),
            fetcher.clone(),
            &cfg.base_url,
        ));
        let tokens = TokenService::new(&cfg.jwt);
        let linker = Arc::new(IdentityLinker::new(
            users.clone(),
            tokens.clone(),
            profiles,
            &cfg.ui_url,
        ));
        Fixture {
            linker,
            users,
            fetcher,
            tokens,
        }
    }

    fn google(email: &str, name: &str) -> Value {
        json!({"email": email, "name": name, "picture": "https://lh3.example/p.jpg"})
    }

    #[tokio::test]
    async fn first_login_creates_user_with_provider_and_token() {
        let fx = fixture();
        let (user, token) = fx
            .linker
            .resolve("google", &google("Ada@Gmail.com", "Ada"))
            .await
            .unwrap();
        assert_eq!(user.email, "ada@gmail.com");
        assert_eq!(user.provider, AuthProvider::Google);
        assert!(!user.has_password());
        assert_eq!(fx.tokens.verify(&token).unwrap(), "ada@gmail.com");
        assert_eq!(
            user.image_url,
            Some(format!("https://cdn.test.local/{}-social.png", user.id))
        );
    }

    #[tokio::test]
    async fn concurrent_first_login_creates_one_user() {
        let fx = fixture();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let linker = fx.linker.clone();
            handles.push(tokio::spawn(async move {
                linker
                    .resolve("google", &google("race@gmail.com", "Racer"))
                    .await
                    .unwrap()
                    .0
                    .id
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(fx.users.len().await, 1);
    }

    #[tokio::test]
    async fn provider_is_sticky_for_existing_account() {
        let fx = fixture();
        fx.linker
            .resolve("google", &google("ada@example.com", "Ada"))
            .await
            .unwrap();
        let (user, _) = fx
            .linker
            .resolve(
                "github",
                &json!({"login": "ada", "email": "ada@example.com", "name": "Ada"}),
            )
            .await
            .unwrap();
        assert_eq!(user.provider, AuthProvider::Google);
    }

    #[tokio::test]
    async fn name_is_refreshed_when_it_changes() {
        let fx = fixture();
        fx.linker
            .resolve("google", &google("ada@example.com", "Ada"))
            .await
            .unwrap();
        let (user, _) = fx
            .linker
            .resolve("google", &google("ada@example.com", "Ada Lovelace"))
            .await
            .unwrap();
        assert_eq!(user.name.as_deref(), Some("Ada Lovelace"));
    }

    #[tokio::test]
    async fn image_is_backfilled_only_when_absent() {
        let fx = fixture();
        let (first, _) = fx
            .linker
            .resolve("google", &google("ada@example.com", "Ada"))
            .await
            .unwrap();
        assert_eq!(fx.fetcher.calls(), 1);

        let (second, _) = fx
            .linker
            .resolve("google", &google("ada@example.com", "Ada"))
            .await
            .unwrap();
        assert_eq!(fx.fetcher.calls(), 1);
        assert_eq!(second.image_url, first.image_url);
    }

    #[tokio::test]
    async fn image_import_failure_does_not_block_login() {
        let fx = fixture();
        fx.fetcher
            .fail_with(|| AuthError::ResourceUnreachable("status 500".into()));
        let (user, token) = fx
            .linker
            .resolve("google", &google("ada@example.com", "Ada"))
            .await
            .unwrap();
        assert_eq!(user.image_url, None);
        assert!(!token.is_empty());
    }

    #[tokio::test]
    async fn unknown_provider_and_missing_email_are_rejected() {
        let fx = fixture();
        assert!(matches!(
            fx.linker.resolve("myspace", &json!({"email": "a@b.io"})).await,
            Err(AuthError::Validation(_))
        ));
        assert!(matches!(
            fx.linker.resolve("google", &json!({"name": "No Mail"})).await,
            Err(AuthError::Validation(_))
        ));
        assert!(fx.users.is_empty().await);
    }

    #[test]
    fn callback_redirect_points_at_ui() {
        let fx = fixture();
        assert_eq!(
            fx.linker.callback_redirect("jwt.token.value"),
            "https://ui.test.local/login-success?token=jwt.token.value"
        );
    }
}
