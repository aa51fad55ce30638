use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{
    repo::{UserRepository, UserUpdate},
    repo_types::{NewUser, User},
};

#[derive(Default)]
struct Tables {
    by_id: HashMap<Uuid, User>,
    by_email: HashMap<String, Uuid>,
}

#[derive(Default)]
struct Inner {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

/// Process-local user store used when no database is configured and in tests.
#[derive(Clone, Default)]
pub struct MemoryUserRepository {
    inner: Arc<Inner>,
}

impl MemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.tables.lock().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    // Entries nobody holds or waits on are dropped, so the map only tracks rows in use.
    async fn row_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.inner.row_locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(id).or_default().clone()
    }

    #[cfg(test)]
    async fn tracked_row_locks(&self) -> usize {
        let mut locks = self.inner.row_locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.len()
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let tables = self.inner.tables.lock().await;
        Ok(tables
            .by_email
            .get(email)
            .and_then(|id| tables.by_id.get(id))
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        Ok(self.inner.tables.lock().await.by_id.get(&id).cloned())
    }

    async fn insert_if_absent(&self, new_user: NewUser) -> anyhow::Result<Option<User>> {
        let mut tables = self.inner.tables.lock().await;
        if tables.by_email.contains_key(&new_user.email) {
            return Ok(None);
        }
        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            email: new_user.email,
            name: new_user.name,
            password_hash: new_user.password_hash,
            image_url: None,
            provider: new_user.provider,
            created_at: now,
            updated_at: now,
        };
        tables.by_email.insert(user.email.clone(), user.id);
        tables.by_id.insert(user.id, user.clone());
        Ok(Some(user))
    }

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> anyhow::Result<()> {
        // Waits for any open update on the row, as the row-level UPDATE does in Postgres.
        let _row = self.row_lock(id).await.lock_owned().await;
        let mut tables = self.inner.tables.lock().await;
        let user = tables
            .by_id
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("user {id} vanished"))?;
        user.password_hash = Some(password_hash.to_string());
        user.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn begin_update(&self, id: Uuid) -> anyhow::Result<Option<Box<dyn UserUpdate>>> {
        let guard = self.row_lock(id).await.lock_owned().await;
        let Some(user) = self.find_by_id(id).await? else {
            return Ok(None);
        };
        Ok(Some(Box::new(MemoryUserUpdate {
            _guard: guard,
            inner: self.inner.clone(),
            user,
        })))
    }
}

struct MemoryUserUpdate {
    _guard: OwnedMutexGuard<()>,
    inner: Arc<Inner>,
    user: User,
}

#[async_trait]
impl UserUpdate for MemoryUserUpdate {
    fn user(&self) -> &User {
        &self.user
    }

    async fn commit(self: Box<Self>, user: &User) -> anyhow::Result<User> {
        let mut tables = self.inner.tables.lock().await;
        let stored = tables
            .by_id
            .get_mut(&self.user.id)
            .ok_or_else(|| anyhow::anyhow!("user {} vanished", self.user.id))?;
        stored.name = user.name.clone();
        stored.image_url = user.image_url.clone();
        stored.password_hash = user.password_hash.clone();
        stored.updated_at = OffsetDateTime::now_utc();
        Ok(stored.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::repo_types::AuthProvider;

    fn new_user(email: &str) -> NewUser {
        NewUser {
            email: email.into(),
            name: None,
            password_hash: None,
            provider: AuthProvider::Local,
        }
    }

    #[tokio::test]
    async fn insert_if_absent_refuses_taken_email() {
        let repo = MemoryUserRepository::new();
        assert!(repo.insert_if_absent(new_user("a@b.io")).await.unwrap().is_some());
        assert!(repo.insert_if_absent(new_user("a@b.io")).await.unwrap().is_none());
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn dropped_update_is_discarded_and_unlocks() {
        let repo = MemoryUserRepository::new();
        let user = repo.insert_if_absent(new_user("a@b.io")).await.unwrap().unwrap();

        {
            let update = repo.begin_update(user.id).await.unwrap().unwrap();
            let mut changed = update.user().clone();
            changed.name = Some("never".into());
        }

        let update = repo.begin_update(user.id).await.unwrap().unwrap();
        let mut changed = update.user().clone();
        assert_eq!(changed.name, None);
        changed.name = Some("Ada".into());
        let saved = update.commit(&changed).await.unwrap();
        assert_eq!(saved.name.as_deref(), Some("Ada"));
    }

    #[tokio::test]
    async fn second_update_waits_for_first_commit() {
        let repo = MemoryUserRepository::new();
        let user = repo.insert_if_absent(new_user("a@b.io")).await.unwrap().unwrap();

        let first = repo.begin_update(user.id).await.unwrap().unwrap();
        let repo2 = repo.clone();
        let waiter = tokio::spawn(async move {
            let second = repo2.begin_update(user.id).await.unwrap().unwrap();
            second.user().name.clone()
        });

        tokio::task::yield_now().await;
        let mut changed = first.user().clone();
        changed.name = Some("first".into());
        first.commit(&changed).await.unwrap();

        assert_eq!(waiter.await.unwrap().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn row_locks_are_released_once_unused() {
        let repo = MemoryUserRepository::new();
        let mut ids = Vec::new();
        for i in 0..16 {
            let user = repo
                .insert_if_absent(new_user(&format!("u{i}@b.io")))
                .await
                .unwrap()
                .unwrap();
            repo.set_password_hash(user.id, "hash").await.unwrap();
            ids.push(user.id);
        }
        assert_eq!(repo.tracked_row_locks().await, 0);

        let held = repo.begin_update(ids[0]).await.unwrap().unwrap();
        repo.set_password_hash(ids[1], "hash").await.unwrap();
        assert_eq!(repo.tracked_row_locks().await, 1);

        drop(held);
        assert_eq!(repo.tracked_row_locks().await, 0);
        assert!(repo.begin_update(Uuid::new_v4()).await.unwrap().is_none());
        assert_eq!(repo.tracked_row_locks().await, 0);
    }
}
