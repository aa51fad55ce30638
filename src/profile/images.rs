use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::{header::CONTENT_TYPE, redirect::Policy, Client};
use tracing::{debug, warn};
use url::Url;

use crate::error::{AuthError, AuthResult};

/// Upper bound for uploaded and imported images (5 MiB).
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

pub const ALLOWED_IMAGE_TYPES: [&str; 4] = ["image/jpeg", "image/png", "image/gif", "image/webp"];

const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Media type without parameters, lower-cased.
pub fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub fn ext_from_mime(ct: &str) -> Option<&'static str> {
    match ct {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

/// Checks the content type against the allow-list and returns `(essence, extension)`.
pub fn validate_content_type(content_type: &str) -> AuthResult<(String, &'static str)> {
    let ct = essence(content_type);
    match ext_from_mime(&ct) {
        Some(ext) if ALLOWED_IMAGE_TYPES.contains(&ct.as_str()) => Ok((ct, ext)),
        _ => Err(AuthError::InvalidImage(format!(
            "Invalid file type ({}). Only JPG, PNG, GIF, WEBP are allowed.",
            if ct.is_empty() { "none" } else { ct.as_str() }
        ))),
    }
}

pub fn ensure_size(len: usize) -> AuthResult<()> {
    if len > MAX_IMAGE_BYTES {
        return Err(AuthError::PayloadTooLarge);
    }
    Ok(())
}

/// Image bytes accepted by the validators above.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub body: Bytes,
    pub content_type: String,
}

/// Source of third-party images (social avatars, user-pasted links).
#[async_trait]
pub trait RemoteImageSource: Send + Sync {
    /// Downloads and validates an image. Never returns unvalidated bytes.
    async fn fetch(&self, url: &str) -> AuthResult<FetchedImage>;
}

pub struct HttpImageSource {
    client: Client,
    read_timeout: Duration,
}

impl HttpImageSource {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .connect_timeout(connect_timeout)
            .redirect(Policy::limited(5))
            .build()?;
        Ok(Self {
            client,
            read_timeout,
        })
    }

    pub fn with_default_timeouts() -> anyhow::Result<Self> {
        Self::new(Duration::from_secs(5), Duration::from_secs(5))
    }
}

#[async_trait]
impl RemoteImageSource for HttpImageSource {
    async fn fetch(&self, url: &str) -> AuthResult<FetchedImage> {
        let parsed =
            Url::parse(url).map_err(|_| AuthError::InvalidImage("Invalid URL format".into()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AuthError::InvalidImage("Invalid URL format".into()));
        }

        let mut response =
            match tokio::time::timeout(self.read_timeout, self.client.get(parsed).send()).await {
                Err(_) => return Err(AuthError::ResourceUnreachable("request timed out".into())),
                Ok(Err(e)) => {
                    warn!(error = %e, "image fetch failed");
                    return Err(AuthError::ResourceUnreachable(e.to_string()));
                }
                Ok(Ok(r)) => r,
            };

        let status = response.status();
        if !status.is_success() {
            warn!(%status, "image fetch returned non-success status");
            return Err(AuthError::ResourceUnreachable(format!("status {status}")));
        }

        let declared_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let (content_type, _) = validate_content_type(&declared_type)?;

        if let Some(len) = response.content_length() {
            ensure_size(usize::try_from(len).unwrap_or(usize::MAX))?;
        }

        // Content-Length may be absent or wrong, so the cap is enforced while reading.
        let mut body = BytesMut::new();
        loop {
            match tokio::time::timeout(self.read_timeout, response.chunk()).await {
                Err(_) => return Err(AuthError::ResourceUnreachable("read timed out".into())),
                Ok(Err(e)) => return Err(AuthError::ResourceUnreachable(e.to_string())),
                Ok(Ok(None)) => break,
                Ok(Ok(Some(chunk))) => {
                    ensure_size(body.len() + chunk.len())?;
                    body.extend_from_slice(&chunk);
                }
            }
        }

        debug!(bytes = body.len(), content_type = %content_type, "remote image downloaded");
        Ok(FetchedImage {
            body: body.freeze(),
            content_type,
        })
    }
}
