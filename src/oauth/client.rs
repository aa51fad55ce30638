use std::time::Duration;

use anyhow::{anyhow, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use reqwest::{header::ACCEPT, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};
use url::Url;

use super::providers::{self, ProviderSpec};
use crate::{
    config::{AppConfig, OAuthClientConfig, OAuthConfig},
    error::{AuthError, AuthResult},
};

const STATE_AUDIENCE: &str = "oauth2-state";
const STATE_TTL_SECS: i64 = 10 * 60;
const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Serialize, Deserialize)]
struct StateClaims {
    sub: String, // provider name
    aud: String,
    iat: i64,
    exp: i64,
    nonce: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct GithubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

/// Authorization-code flow against the providers in [`providers::PROVIDERS`].
/// CSRF protection uses a signed `state` so no server-side session is needed.
pub struct OAuthClient {
    http: Client,
    clients: OAuthConfig,
    base_url: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl OAuthClient {
    pub fn new(cfg: &AppConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            clients: cfg.oauth.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            encoding: EncodingKey::from_secret(cfg.jwt.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.jwt.secret.as_bytes()),
        })
    }

    fn enabled(&self, provider: &str) -> AuthResult<(&'static ProviderSpec, &OAuthClientConfig)> {
        let spec = providers::find(provider)
            .ok_or_else(|| AuthError::Validation(format!("Unsupported provider: {provider}")))?;
        let client = self
            .clients
            .client(spec.name)
            .ok_or_else(|| AuthError::Validation(format!("Provider {} is not enabled", spec.name)))?;
        Ok((spec, client))
    }

    pub fn redirect_uri(&self, spec: &ProviderSpec) -> String {
        format!("{}/login/oauth2/code/{}", self.base_url, spec.name)
    }

    /// Consent-page URL the browser is sent to.
    pub fn authorization_url(&self, provider: &str) -> AuthResult<String> {
        let (spec, client) = self.enabled(provider)?;
        let state = self.sign_state(spec.name, OffsetDateTime::now_utc())?;

        let mut url = Url::parse(spec.authorize_url).context("provider authorize url")?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &client.client_id)
            .append_pair("redirect_uri", &self.redirect_uri(spec))
            .append_pair("scope", spec.scopes)
            .append_pair("state", &state);
        Ok(url.into())
    }

    fn sign_state(&self, provider: &str, now: OffsetDateTime) -> AuthResult<String> {
        let claims = StateClaims {
            sub: provider.to_string(),
            aud: STATE_AUDIENCE.to_string(),
            iat: now.unix_timestamp(),
            exp: now.unix_timestamp() + STATE_TTL_SECS,
            nonce: OsRng
                .sample_iter(&Alphanumeric)
                .take(16)
                .map(char::from)
                .collect(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| anyhow!("state encode: {e}").into())
    }

    /// Accepts only a live state minted for the same provider.
    pub fn verify_state(&self, provider: &str, state: &str) -> AuthResult<()> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_audience(&[STATE_AUDIENCE]);
        validation.set_required_spec_claims(&["exp", "sub", "aud"]);

        let claims = decode::<StateClaims>(state, &self.decoding, &validation)
            .map_err(|e| {
                warn!(error = %e, "rejected oauth2 state");
                AuthError::InvalidToken
            })?
            .claims;
        if !claims.sub.eq_ignore_ascii_case(provider) {
            warn!(expected = %provider, got = %claims.sub, "oauth2 state minted for another provider");
            return Err(AuthError::InvalidToken);
        }
        Ok(())
    }

    /// Exchanges the authorization code and returns the raw user-info attributes.
    #[instrument(skip(self, code))]
    pub async fn fetch_attributes(&self, provider: &str, code: &str) -> AuthResult<Value> {
        let (spec, client) = self.enabled(provider)?;
        let redirect_uri = self.redirect_uri(spec);

        let response = self
            .http
            .post(spec.token_url)
            .header(ACCEPT, "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri.as_str()),
                ("client_id", client.client_id.as_str()),
                ("client_secret", client.client_secret.as_str()),
            ])
            .send()
            .await
            .context("oauth2 token request")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("{} token endpoint returned {status}: {body}", spec.name).into());
        }
        let token: TokenResponse = response.json().await.context("oauth2 token response")?;

        let mut attributes: Value = self
            .get_json(spec.userinfo_url, &token.access_token)
            .await
            .context("oauth2 user-info")?;
        debug!(provider = spec.name, "user-info fetched");

        if spec.name == "github" && attributes["email"].as_str().is_none() {
            if let Some(email) = self.github_primary_email(&token.access_token).await {
                attributes["email"] = Value::String(email);
            }
        }
        Ok(attributes)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        access_token: &str,
    ) -> anyhow::Result<T> {
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .header(ACCEPT, "application/json")
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// GitHub hides private addresses from `/user`; the emails endpoint has them.
    async fn github_primary_email(&self, access_token: &str) -> Option<String> {
        match self
            .get_json::<Vec<GithubEmail>>("https://api.github.com/user/emails", access_token)
            .await
        {
            Ok(emails) => emails
                .into_iter()
                .find(|e| e.primary && e.verified)
                .map(|e| e.email),
            Err(e) => {
                warn!(error = %e, "could not list github emails");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OAuthClient {
        OAuthClient::new(&AppConfig::for_tests()).unwrap()
    }

    #[test]
    fn authorization_url_carries_client_and_state() {
        let c = client();
        let url = Url::parse(&c.authorization_url("google").unwrap()).unwrap();
        assert_eq!(url.host_str(), Some("accounts.google.com"));
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["client_id"], "google-id");
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(
            pairs["redirect_uri"],
            "https://api.test.local/login/oauth2/code/google"
        );
        c.verify_state("google", &pairs["state"]).unwrap();
    }

    #[test]
    fn unconfigured_or_unknown_provider_is_rejected() {
        let c = client();
        assert!(matches!(
            c.authorization_url("github"),
            Err(AuthError::Validation(_))
        ));
        assert!(matches!(
            c.authorization_url("myspace"),
            Err(AuthError::Validation(_))
        ));
    }

    #[test]
    fn state_is_bound_to_provider_and_lifetime() {
        let c = client();
        let now = OffsetDateTime::now_utc();
        let state = c.sign_state("google", now).unwrap();
        assert!(matches!(
            c.verify_state("github", &state),
            Err(AuthError::InvalidToken)
        ));

        let stale = c
            .sign_state("google", now - time::Duration::seconds(STATE_TTL_SECS + 5))
            .unwrap();
        assert!(matches!(
            c.verify_state("google", &stale),
            Err(AuthError::InvalidToken)
        ));
        assert!(c.verify_state("google", "garbage").is_err());
    }
}
