use anyhow::Context;
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::repo_types::{NewUser, User, UserRow};

/// Persistence seam for user records.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>>;

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>>;

    /// Inserts the user unless the email is already taken.
    /// Returns `None` when another record owns the email.
    async fn insert_if_absent(&self, new_user: NewUser) -> anyhow::Result<Option<User>>;

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> anyhow::Result<()>;

    /// Opens an exclusive update on one user. Other updates for the same user wait
    /// until this one is committed or dropped. Dropping without commit discards it.
    async fn begin_update(&self, id: Uuid) -> anyhow::Result<Option<Box<dyn UserUpdate>>>;
}

/// A locked, in-flight update of a single user record.
#[async_trait]
pub trait UserUpdate: Send {
    /// Snapshot taken when the lock was acquired.
    fn user(&self) -> &User;

    /// Writes name, image URL and password hash, then releases the lock.
    async fn commit(self: Box<Self>, user: &User) -> anyhow::Result<User>;
}

const USER_COLUMNS: &str =
    "id, email, name, password_hash, image_url, provider, created_at, updated_at";

#[derive(Clone)]
pub struct PgUserRepository {
    db: PgPool,
}

impl PgUserRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.db)
        .await
        .context("find user by email")?;
        row.map(User::try_from).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .context("find user by id")?;
        row.map(User::try_from).transpose()
    }

    async fn insert_if_absent(&self, new_user: NewUser) -> anyhow::Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            INSERT INTO users (id, email, name, password_hash, provider)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (email) DO NOTHING
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&new_user.email)
        .bind(&new_user.name)
        .bind(&new_user.password_hash)
        .bind(new_user.provider.as_str())
        .fetch_optional(&self.db)
        .await
        .context("insert user")?;
        row.map(User::try_from).transpose()
    }

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(password_hash)
            .execute(&self.db)
            .await
            .context("update password hash")?;
        Ok(())
    }

    async fn begin_update(&self, id: Uuid) -> anyhow::Result<Option<Box<dyn UserUpdate>>> {
        let mut tx = self.db.begin().await.context("begin tx")?;
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .context("lock user row")?;

        match row {
            Some(row) => Ok(Some(Box::new(PgUserUpdate {
                tx,
                user: User::try_from(row)?,
            }))),
            None => Ok(None),
        }
    }
}

struct PgUserUpdate {
    tx: Transaction<'static, Postgres>,
    user: User,
}

#[async_trait]
impl UserUpdate for PgUserUpdate {
    fn user(&self) -> &User {
        &self.user
    }

    async fn commit(self: Box<Self>, user: &User) -> anyhow::Result<User> {
        let PgUserUpdate { mut tx, user: locked } = *self;
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            UPDATE users
               SET name = $2, image_url = $3, password_hash = $4, updated_at = now()
             WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(locked.id)
        .bind(&user.name)
        .bind(&user.image_url)
        .bind(&user.password_hash)
        .fetch_one(&mut *tx)
        .await
        .context("update user")?;
        tx.commit().await.context("commit tx")?;
        User::try_from(row)
    }
}
