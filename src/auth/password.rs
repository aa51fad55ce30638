use std::sync::Arc;

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use lazy_static::lazy_static;
use rand::rngs::OsRng;
use regex::Regex;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    error::{AuthError, AuthResult},
    users::{normalize_email, AuthProvider, NewUser, User, UserRepository},
};

pub const MIN_PASSWORD_LENGTH: usize = 8;

pub fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub fn validate_new_password(raw: &str) -> AuthResult<()> {
    if raw.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(AuthError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }
    Ok(())
}

pub fn hash_password(plain: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| {
            error!(error = %e, "argon2 hash_password error");
            anyhow::anyhow!(e.to_string())
        })?
        .to_string();
    Ok(hash)
}

pub fn verify_password(plain: &str, hash: &str) -> anyhow::Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| {
        error!(error = %e, "argon2 parse hash error");
        anyhow::anyhow!(e.to_string())
    })?;
    Ok(Argon2::default()
        .verify_password(plain.as_bytes(), &parsed)
        .is_ok())
}

// Argon2 runs on the blocking pool.
async fn hash_off_thread(plain: &str) -> anyhow::Result<String> {
    let plain = plain.to_string();
    tokio::task::spawn_blocking(move || hash_password(&plain)).await?
}

async fn verify_off_thread(plain: &str, hash: &str) -> anyhow::Result<bool> {
    let (plain, hash) = (plain.to_string(), hash.to_string());
    tokio::task::spawn_blocking(move || verify_password(&plain, &hash)).await?
}

/// Hash verified against when a login has no stored hash to check, so every
/// failed login costs one Argon2 verification.
fn dummy_hash() -> Option<&'static str> {
    lazy_static! {
        static ref DUMMY_HASH: Option<String> = hash_password("identity-core-dummy").ok();
    }
    DUMMY_HASH.as_deref()
}

async fn burn_verification(raw_password: &str) {
    if let Some(hash) = dummy_hash() {
        let _ = verify_off_thread(raw_password, hash).await;
    }
}

/// Local password credentials: registration, login and rotation.
#[derive(Clone)]
pub struct PasswordCredentialStore {
    users: Arc<dyn UserRepository>,
}

impl PasswordCredentialStore {
    pub fn new(users: Arc<dyn UserRepository>) -> Self {
        Self { users }
    }

    #[instrument(skip(self, raw_password))]
    pub async fn register(
        &self,
        email: &str,
        name: Option<&str>,
        raw_password: &str,
    ) -> AuthResult<User> {
        let email = normalize_email(email);
        if !is_valid_email(&email) {
            warn!(email = %email, "invalid email");
            return Err(AuthError::Validation("Invalid email".into()));
        }
        validate_new_password(raw_password)?;

        if self.users.find_by_email(&email).await?.is_some() {
            warn!(email = %email, "email already registered");
            return Err(AuthError::DuplicateAccount);
        }

        let hash = hash_off_thread(raw_password).await?;
        let new_user = NewUser {
            email: email.clone(),
            name: name.map(str::trim).filter(|n| !n.is_empty()).map(String::from),
            password_hash: Some(hash),
            provider: AuthProvider::Local,
        };
        // The lookup above is only a fast path; the insert is what enforces uniqueness.
        let user = self
            .users
            .insert_if_absent(new_user)
            .await?
            .ok_or(AuthError::DuplicateAccount)?;

        info!(user_id = %user.id, email = %user.email, "user registered");
        Ok(user)
    }

    /// Both failure variants must be rendered identically to the caller.
    #[instrument(skip(self, raw_password))]
    pub async fn authenticate(&self, email: &str, raw_password: &str) -> AuthResult<User> {
        let email = normalize_email(email);
        let Some(user) = self.users.find_by_email(&email).await? else {
            warn!(email = %email, "login unknown email");
            burn_verification(raw_password).await;
            return Err(AuthError::NotFound);
        };

        let Some(hash) = user.password_hash.as_deref().filter(|h| !h.is_empty()) else {
            warn!(user_id = %user.id, "login on account without password");
            burn_verification(raw_password).await;
            return Err(AuthError::InvalidCredential);
        };

        if !verify_off_thread(raw_password, hash).await? {
            warn!(user_id = %user.id, "login invalid password");
            return Err(AuthError::InvalidCredential);
        }

        info!(user_id = %user.id, "user logged in");
        Ok(user)
    }

    /// Rotates the password. Accounts without one get their first local credential
    /// and `current_raw` is ignored.
    #[instrument(skip_all, fields(user_id = %user.id))]
    pub async fn change_password(
        &self,
        user: &User,
        current_raw: Option<&str>,
        new_raw: &str,
    ) -> AuthResult<()> {
        validate_new_password(new_raw)?;

        if let Some(existing) = user.password_hash.as_deref().filter(|h| !h.is_empty()) {
            let current = current_raw.ok_or(AuthError::CurrentPasswordRequired)?;
            if !verify_off_thread(current, existing).await? {
                return Err(AuthError::IncorrectCurrentPassword);
            }
            if verify_off_thread(new_raw, existing).await? {
                return Err(AuthError::PasswordUnchanged);
            }
        }

        self.set_password(user.id, new_raw).await?;
        info!("password changed");
        Ok(())
    }

    /// Unconditionally replaces the stored hash.
    pub async fn set_password(&self, user_id: Uuid, new_raw: &str) -> AuthResult<()> {
        let hash = hash_off_thread(new_raw).await?;
        self.users.set_password_hash(user_id, &hash).await?;
        Ok(())
    }
}
