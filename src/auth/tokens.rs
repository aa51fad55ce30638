use std::time::Duration;

use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::{debug, warn};

use crate::{
    config::JwtConfig,
    error::{AuthError, AuthResult},
};

/// Session token payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // subject email
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

/// Issues and verifies HS256 session tokens. The key is fixed for the process lifetime.
#[derive(Clone)]
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
    ttl: Duration,
}

impl TokenService {
    pub fn new(cfg: &JwtConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
            ttl: Duration::from_secs((cfg.ttl_minutes.max(1) as u64) * 60),
        }
    }

    #[cfg(test)]
    pub fn lifetime(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, subject_email: &str) -> AuthResult<String> {
        self.issue_at(subject_email, OffsetDateTime::now_utc())
    }

    pub fn issue_at(&self, subject_email: &str, issued_at: OffsetDateTime) -> AuthResult<String> {
        let exp = issued_at + TimeDuration::seconds(self.ttl.as_secs() as i64);
        let claims = Claims {
            sub: subject_email.to_string(),
            iat: issued_at.unix_timestamp(),
            exp: exp.unix_timestamp(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| anyhow::anyhow!("jwt encode: {e}"))?;
        debug!(subject = %subject_email, "session token issued");
        Ok(token)
    }

    /// Returns the subject email of a valid token.
    pub fn verify(&self, token: &str) -> AuthResult<String> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);

        match decode::<Claims>(token, &self.decoding, &validation) {
            Ok(data) => Ok(data.claims.sub),
            Err(e) if matches!(e.kind(), ErrorKind::ExpiredSignature) => {
                debug!("session token expired");
                Err(AuthError::ExpiredToken)
            }
            Err(e) => {
                warn!(error = %e, "session token rejected");
                Err(AuthError::InvalidToken)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn make_service() -> TokenService {
        TokenService::new(&AppConfig::for_tests().jwt)
    }

    #[test]
    fn fresh_token_verifies_to_subject() {
        let svc = make_service();
        let token = svc.issue("ada@example.com").expect("issue");
        assert_eq!(svc.verify(&token).expect("verify"), "ada@example.com");
    }

    #[test]
    fn default_lifetime_is_one_day() {
        assert_eq!(make_service().lifetime(), Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn token_past_lifetime_is_expired() {
        let svc = make_service();
        let issued = OffsetDateTime::now_utc() - TimeDuration::hours(25);
        let token = svc.issue_at("ada@example.com", issued).expect("issue");
        assert!(matches!(svc.verify(&token), Err(AuthError::ExpiredToken)));
    }

    #[test]
    fn token_just_inside_lifetime_is_valid() {
        let svc = make_service();
        let issued = OffsetDateTime::now_utc() - TimeDuration::hours(23);
        let token = svc.issue_at("ada@example.com", issued).expect("issue");
        assert!(svc.verify(&token).is_ok());
    }

    #[test]
    fn tampering_any_character_invalidates() {
        let svc = make_service();
        let token = svc.issue("ada@example.com").expect("issue");
        for (i, c) in token.char_indices() {
            if c == '.' {
                continue;
            }
            let swapped = if c == 'A' { 'B' } else { 'A' };
            let mut tampered = token.clone();
            tampered.replace_range(i..i + 1, &swapped.to_string());
            assert!(svc.verify(&tampered).is_err(), "tampered at {i} still verified");
        }
    }

    #[test]
    fn foreign_key_or_audience_is_rejected() {
        let svc = make_service();
        let mut other_cfg = AppConfig::for_tests().jwt;
        other_cfg.secret = "another-secret".into();
        let foreign = TokenService::new(&other_cfg).issue("ada@example.com").unwrap();
        assert!(matches!(svc.verify(&foreign), Err(AuthError::InvalidToken)));

        let mut aud_cfg = AppConfig::for_tests().jwt;
        aud_cfg.audience = "somebody-else".into();
        let wrong_aud = TokenService::new(&aud_cfg).issue("ada@example.com").unwrap();
        assert!(matches!(svc.verify(&wrong_aud), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn garbage_is_invalid() {
        let svc = make_service();
        assert!(matches!(svc.verify("not-a-jwt"), Err(AuthError::InvalidToken)));
    }
}
