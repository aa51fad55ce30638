use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    /// Public base every managed image URL starts with, without trailing slash.
    pub public_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub sender_address: String,
    pub sender_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct OAuthConfig {
    pub google: Option<OAuthClientConfig>,
    pub github: Option<OAuthClientConfig>,
}

impl OAuthConfig {
    pub fn client(&self, provider: &str) -> Option<&OAuthClientConfig> {
        match provider {
            "google" => self.google.as_ref(),
            "github" => self.github.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Postgres connection string; in-memory persistence is used when absent.
    pub database_url: Option<String>,
    /// Public base URL of this service, e.g. `https://api.example.com`.
    pub base_url: String,
    /// Base URL of the web UI that receives reset links and login redirects.
    pub ui_url: String,
    pub jwt: JwtConfig,
    pub reset_ttl_minutes: i64,
    pub storage: StorageConfig,
    pub smtp: Option<SmtpConfig>,
    pub oauth: OAuthConfig,
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn trim_slash(v: String) -> String {
    v.trim_end_matches('/').to_string()
}

/// `<base><path>?token=<token>` with the token query-encoded.
pub fn ui_link(base: &str, path: &str, token: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(token.as_bytes()).collect();
    format!("{}{}?token={}", base.trim_end_matches('/'), path, encoded)
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").ok();
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            issuer: var_or("JWT_ISSUER", "identity-core"),
            audience: var_or("JWT_AUDIENCE", "identity-core-users"),
            ttl_minutes: std::env::var("JWT_TTL_MINUTES")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(60 * 24),
        };

        let storage = StorageConfig {
            endpoint: var_or("S3_ENDPOINT", "http://localhost:9000"),
            bucket: var_or("S3_BUCKET", "profile-images"),
            access_key: var_or("S3_ACCESS_KEY", "minioadmin"),
            secret_key: var_or("S3_SECRET_KEY", "minioadmin"),
            region: var_or("S3_REGION", "us-east-1"),
            public_url: trim_slash(var_or(
                "S3_PUBLIC_URL",
                "http://localhost:9000/profile-images",
            )),
        };

        let smtp = match std::env::var("SMTP_HOST") {
            Ok(host) => Some(SmtpConfig {
                host,
                port: std::env::var("SMTP_PORT")
                    .ok()
                    .and_then(|v| v.parse::<u16>().ok())
                    .unwrap_or(587),
                username: var_or("SMTP_USERNAME", ""),
                password: var_or("SMTP_PASSWORD", ""),
                sender_address: std::env::var("EMAIL_SENDER_ADDRESS")
                    .context("EMAIL_SENDER_ADDRESS must be set when SMTP_HOST is")?,
                sender_name: var_or("EMAIL_SENDER_NAME", "Job Tracker"),
            }),
            Err(_) => None,
        };

        let oauth_client = |prefix: &str| -> Option<OAuthClientConfig> {
            let client_id = std::env::var(format!("{prefix}_CLIENT_ID")).ok()?;
            let client_secret = std::env::var(format!("{prefix}_CLIENT_SECRET")).ok()?;
            Some(OAuthClientConfig {
                client_id,
                client_secret,
            })
        };

        Ok(Self {
            database_url,
            base_url: trim_slash(var_or("APP_BASE_URL", "http://localhost:8080")),
            ui_url: trim_slash(var_or("APP_UI_URL", "http://localhost:4200")),
            jwt,
            reset_ttl_minutes: 15,
            storage,
            smtp,
            oauth: OAuthConfig {
                google: oauth_client("GOOGLE"),
                github: oauth_client("GITHUB"),
            },
        })
    }

    /// Fixed configuration for tests and local fakes.
    pub fn for_tests() -> Self {
        Self {
            database_url: None,
            base_url: "https://api.test.local".into(),
            ui_url: "https://ui.test.local".into(),
            jwt: JwtConfig {
                secret: "test-secret".into(),
                issuer: "test-issuer".into(),
                audience: "test-aud".into(),
                ttl_minutes: 60 * 24,
            },
            reset_ttl_minutes: 15,
            storage: StorageConfig {
                endpoint: "fake".into(),
                bucket: "fake".into(),
                access_key: "fake".into(),
                secret_key: "fake".into(),
                region: "us-east-1".into(),
                public_url: "https://cdn.test.local".into(),
            },
            smtp: None,
            oauth: OAuthConfig {
                google: Some(OAuthClientConfig {
                    client_id: "google-id".into(),
                    client_secret: "google-secret".into(),
                }),
                github: None,
            },
        }
    }
}
