use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::repo::{ResetToken, ResetTokenRepository};

#[derive(Clone, Default)]
pub struct MemoryResetTokenRepository {
    tokens: Arc<Mutex<HashMap<String, ResetToken>>>,
}

impl MemoryResetTokenRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tokens.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ResetTokenRepository for MemoryResetTokenRepository {
    async fn replace_for_user(&self, token: &ResetToken) -> anyhow::Result<()> {
        let mut tokens = self.tokens.lock().await;
        tokens.retain(|_, t| t.user_id != token.user_id);
        tokens.insert(token.token.clone(), token.clone());
        Ok(())
    }

    async fn take(&self, token: &str) -> anyhow::Result<Option<ResetToken>> {
        Ok(self.tokens.lock().await.remove(token))
    }

    async fn find_for_user(&self, user_id: Uuid) -> anyhow::Result<Option<ResetToken>> {
        Ok(self
            .tokens
            .lock()
            .await
            .values()
            .find(|t| t.user_id == user_id)
            .cloned())
    }
}
