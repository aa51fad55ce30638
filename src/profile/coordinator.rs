use std::sync::Arc;

use bytes::Bytes;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::images::{ensure_size, validate_content_type, RemoteImageSource};
use crate::{
    error::{AuthError, AuthResult},
    storage::ObjectStore,
    users::{User, UserRepository},
};

/// Raw file supplied with a profile update.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub bytes: Bytes,
    pub content_type: String,
}

/// Applies profile updates and keeps `users.image_url` in step with the object store.
pub struct ProfileImageCoordinator {
    users: Arc<dyn UserRepository>,
    store: Arc<dyn ObjectStore>,
    fetcher: Arc<dyn RemoteImageSource>,
    service_base_url: String,
}

fn is_under(url: &str, base: &str) -> bool {
    let base = base.trim_end_matches('/');
    !base.is_empty()
        && url
            .strip_prefix(base)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

fn unix_millis() -> i128 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000
}

impl ProfileImageCoordinator {
    pub fn new(
        users: Arc<dyn UserRepository>,
        store: Arc<dyn ObjectStore>,
        fetcher: Arc<dyn RemoteImageSource>,
        service_base_url: &str,
    ) -> Self {
        Self {
            users,
            store,
            fetcher,
            service_base_url: service_base_url.to_string(),
        }
    }

    /// URLs this system issued; they are reused verbatim, never re-fetched.
    pub fn is_canonical(&self, url: &str) -> bool {
        self.store.key_for_url(url).is_some() || is_under(url, &self.service_base_url)
    }

    /// Updates name and, optionally, the image. Updates for one user never interleave.
    #[instrument(skip(self, file), fields(has_file = file.is_some()))]
    pub async fn update_profile(
        &self,
        user_id: Uuid,
        name: &str,
        image_url: Option<&str>,
        file: Option<ImageUpload>,
    ) -> AuthResult<User> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AuthError::Validation("Name is required".into()));
        }

        let update = self
            .users
            .begin_update(user_id)
            .await?
            .ok_or(AuthError::NotFound)?;
        let old_image_url = update.user().image_url.clone();
        let mut changed = update.user().clone();
        changed.name = Some(name.to_string());

        let fresh = match (file.filter(|f| !f.bytes.is_empty()), image_url) {
            (Some(file), _) => Some(self.upload_file(user_id, file).await?),
            (None, Some(url)) if !url.trim().is_empty() => {
                let url = url.trim();
                if !self.is_canonical(url) {
                    Some(self.import_remote_image(user_id, url).await?)
                } else if self.store.key_for_url(url).is_some()
                    && old_image_url.as_deref() != Some(url)
                {
                    // A managed URL is only reusable as the image this user already has.
                    warn!(user_id = %user_id, url = %url, "managed image url not held by user");
                    return Err(AuthError::InvalidImage(
                        "Image URL does not belong to this account".into(),
                    ));
                } else {
                    changed.image_url = Some(url.to_string());
                    None
                }
            }
            _ => None,
        };
        if let Some(url) = &fresh {
            changed.image_url = Some(url.clone());
        }
        let replaced = changed.image_url != old_image_url;

        let saved = match update.commit(&changed).await {
            Ok(user) => user,
            Err(e) => {
                // Nothing references the fresh upload yet.
                if let Some(url) = &fresh {
                    if old_image_url.as_deref() != Some(url.as_str()) {
                        self.delete_owned(user_id, url).await;
                    }
                }
                return Err(e.into());
            }
        };

        if replaced {
            if let Some(old) = &old_image_url {
                self.retire(user_id, old).await;
            }
        }

        info!(user_id = %saved.id, image_changed = replaced, "profile updated");
        Ok(saved)
    }

    /// Downloads a third-party image and stores it under `<userId>-social.<ext>`.
    pub async fn import_remote_image(&self, user_id: Uuid, url: &str) -> AuthResult<String> {
        let image = self.fetcher.fetch(url).await?;
        let (content_type, ext) = validate_content_type(&image.content_type)?;
        ensure_size(image.body.len())?;
        let key = format!("{user_id}-social.{ext}");
        self.put(&key, image.body, &content_type).await
    }

    async fn upload_file(&self, user_id: Uuid, file: ImageUpload) -> AuthResult<String> {
        let (content_type, ext) = validate_content_type(&file.content_type)?;
        ensure_size(file.bytes.len())?;
        let key = format!("{user_id}-{}.{ext}", unix_millis());
        self.put(&key, file.bytes, &content_type).await
    }

    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> AuthResult<String> {
        self.store
            .put_object(key, body, content_type)
            .await
            .map_err(|e| AuthError::StorageUnavailable(format!("{e:#}")))?;
        info!(key = %key, "image uploaded");
        Ok(self.store.public_url(key))
    }

    /// Storage key of `url` when it is a managed blob uploaded for `user_id`.
    fn owned_key<'a>(&self, user_id: Uuid, url: &'a str) -> Option<&'a str> {
        self.store
            .key_for_url(url)
            .filter(|key| key.starts_with(&format!("{user_id}-")))
    }

    /// Deletes a replaced image under the user's row lock, so no update can pick the
    /// URL up again while the blob goes away.
    async fn retire(&self, user_id: Uuid, old_url: &str) {
        if self.owned_key(user_id, old_url).is_none() {
            return;
        }
        let guard = match self.users.begin_update(user_id).await {
            Ok(Some(guard)) => guard,
            Ok(None) => return,
            Err(e) => {
                warn!(user_id = %user_id, error = ?e, "could not lock user to retire old image");
                return;
            }
        };
        if guard.user().image_url.as_deref() != Some(old_url) {
            self.delete_owned(user_id, old_url).await;
        }
        drop(guard);
    }

    /// Best-effort delete of a blob owned by the user. Failures are only logged.
    async fn delete_owned(&self, user_id: Uuid, url: &str) {
        let Some(key) = self.owned_key(user_id, url) else {
            return;
        };
        match self.store.delete_object(key).await {
            Ok(()) => info!(key = %key, "deleted old image"),
            Err(e) => warn!(key = %key, error = ?e, "failed to delete old image"),
        }
    }
}
