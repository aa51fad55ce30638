use std::sync::Arc;

use sqlx::PgPool;
use tracing::info;

use crate::{
    auth::{PasswordCredentialStore, TokenService},
    config::AppConfig,
    notify::{LogMailer, MailTransport, NotificationGateway, SmtpMailer},
    oauth::{IdentityLinker, OAuthClient},
    profile::{HttpImageSource, ProfileImageCoordinator, RemoteImageSource},
    reset::{
        MemoryResetTokenRepository, PgResetTokenRepository, ResetTokenLedger,
        ResetTokenRepository,
    },
    storage::{MemoryObjectStore, ObjectStore, S3Store},
    users::{MemoryUserRepository, PgUserRepository, UserRepository},
};

/// Infrastructure the components are wired from.
pub struct Backends {
    pub users: Arc<dyn UserRepository>,
    pub reset_tokens: Arc<dyn ResetTokenRepository>,
    pub store: Arc<dyn ObjectStore>,
    pub fetcher: Arc<dyn RemoteImageSource>,
    pub mailer: Arc<dyn MailTransport>,
}

#[derive(Clone)]
pub struct AppState {
    pub db: Option<PgPool>,
    pub config: Arc<AppConfig>,
    pub users: Arc<dyn UserRepository>,
    pub tokens: TokenService,
    pub credentials: PasswordCredentialStore,
    pub reset: Arc<ResetTokenLedger>,
    pub profiles: Arc<ProfileImageCoordinator>,
    pub linker: Arc<IdentityLinker>,
    pub oauth: Arc<OAuthClient>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let (db, users, reset_tokens) = match &config.database_url {
            Some(url) => {
                let db = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(10)
                    .connect(url)
                    .await?;
                (
                    Some(db.clone()),
                    Arc::new(PgUserRepository::new(db.clone())) as Arc<dyn UserRepository>,
                    Arc::new(PgResetTokenRepository::new(db)) as Arc<dyn ResetTokenRepository>,
                )
            }
            None => {
                info!("DATABASE_URL not set; using in-memory persistence");
                (
                    None,
                    Arc::new(MemoryUserRepository::new()) as Arc<dyn UserRepository>,
                    Arc::new(MemoryResetTokenRepository::new()) as Arc<dyn ResetTokenRepository>,
                )
            }
        };

        // Real S3/MinIO
        let store = Arc::new(S3Store::new(&config.storage).await?) as Arc<dyn ObjectStore>;

        let mailer = match &config.smtp {
            Some(smtp) => Arc::new(SmtpMailer::new(smtp)?) as Arc<dyn MailTransport>,
            None => {
                info!("SMTP_HOST not set; reset links will only be logged");
                Arc::new(LogMailer) as Arc<dyn MailTransport>
            }
        };

        let backends = Backends {
            users,
            reset_tokens,
            store,
            fetcher: Arc::new(HttpImageSource::with_default_timeouts()?),
            mailer,
        };
        let mut state = Self::from_parts(config, backends)?;
        state.db = db;
        Ok(state)
    }

    pub fn from_parts(config: Arc<AppConfig>, b: Backends) -> anyhow::Result<Self> {
        let tokens = TokenService::new(&config.jwt);
        let credentials = PasswordCredentialStore::new(b.users.clone());
        let notifier = NotificationGateway::new(b.mailer, &config.ui_url);
        let reset = Arc::new(ResetTokenLedger::new(
            b.users.clone(),
            b.reset_tokens,
            credentials.clone(),
            notifier,
            config.reset_ttl_minutes,
        ));
        let profiles = Arc::new(ProfileImageCoordinator::new(
            b.users.clone(),
            b.store,
            b.fetcher,
            &config.base_url,
        ));
        let linker = Arc::new(IdentityLinker::new(
            b.users.clone(),
            tokens.clone(),
            profiles.clone(),
            &config.ui_url,
        ));
        let oauth = Arc::new(OAuthClient::new(&config)?);

        Ok(Self {
            db: None,
            config,
            users: b.users,
            tokens,
            credentials,
            reset,
            profiles,
            linker,
            oauth,
        })
    }

    /// Fully in-memory state with the fixed test configuration.
    pub fn fake() -> Self {
        let config = Arc::new(AppConfig::for_tests());
        let backends = Backends {
            users: Arc::new(MemoryUserRepository::new()),
            reset_tokens: Arc::new(MemoryResetTokenRepository::new()),
            store: Arc::new(MemoryObjectStore::new(config.storage.public_url.clone())),
            fetcher: Arc::new(HttpImageSource::with_default_timeouts().expect("http client")),
            mailer: Arc::new(LogMailer),
        };
        Self::from_parts(config, backends).expect("fake state")
    }
}
