use anyhow::Result;
use async_trait::async_trait;
use shared::domain::ConversationId;
use storage::Storage;
use tokio::sync::Mutex;

use crate::token_store::TokenPair;

#[async_trait]
pub trait DurableState: Send + Sync {
    async fn load_tokens(&self) -> Result<Option<TokenPair>>;
    async fn save_tokens(&self, pair: &TokenPair) -> Result<()>;
    async fn clear_tokens(&self) -> Result<()>;
    async fn load_active_conversation(&self) -> Result<Option<ConversationId>>;
    async fn save_active_conversation(&self, conversation_id: ConversationId) -> Result<()>;
    async fn clear_active_conversation(&self) -> Result<()>;
}

#[async_trait]
impl DurableState for Storage {
    async fn load_tokens(&self) -> Result<Option<TokenPair>> {
        Ok(self
            .load_token_pair()
            .await?
            .map(|stored| TokenPair::new(stored.access_token, stored.refresh_token)))
    }

    async fn save_tokens(&self, pair: &TokenPair) -> Result<()> {
        self.save_token_pair(pair.access_token(), pair.refresh_token())
            .await
    }

    async fn clear_tokens(&self) -> Result<()> {
        self.clear_token_pair().await
    }

    async fn load_active_conversation(&self) -> Result<Option<ConversationId>> {
        Storage::load_active_conversation(self).await
    }

    async fn save_active_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        Storage::save_active_conversation(self, conversation_id).await
    }

    async fn clear_active_conversation(&self) -> Result<()> {
        Storage::clear_active_conversation(self).await
    }
}

#[derive(Default)]
pub struct MemoryDurableState {
    tokens: Mutex<Option<TokenPair>>,
    active_conversation: Mutex<Option<ConversationId>>,
}

impl MemoryDurableState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableState for MemoryDurableState {
    async fn load_tokens(&self) -> Result<Option<TokenPair>> {
        Ok(self.tokens.lock().await.clone())
    }

    async fn save_tokens(&self, pair: &TokenPair) -> Result<()> {
        *self.tokens.lock().await = Some(pair.clone());
        Ok(())
    }

    async fn clear_tokens(&self) -> Result<()> {
        self.tokens.lock().await.take();
        Ok(())
    }

    async fn load_active_conversation(&self) -> Result<Option<ConversationId>> {
        Ok(*self.active_conversation.lock().await)
    }

    async fn save_active_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        *self.active_conversation.lock().await = Some(conversation_id);
        Ok(())
    }

    async fn clear_active_conversation(&self) -> Result<()> {
        self.active_conversation.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/durable_tests.rs"]
mod tests;
