use async_trait::async_trait;
use dashmap::DashMap;

use crate::errors::GatewayResult;
use crate::models::message::Message;

/// Optional external backing for conversation windows
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Messages previously saved for the id, oldest first. Unknown ids load as empty.
    async fn load(&self, id: &str) -> GatewayResult<Vec<Message>>;

    /// Replace the stored window for the id
    async fn save(&self, id: &str, messages: &[Message]) -> GatewayResult<()>;
}

/// Process-local store, mostly useful to share windows between memories and in tests
#[derive(Debug, Default)]
pub struct InMemoryStore {
    windows: DashMap<String, Vec<Message>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn load(&self, id: &str) -> GatewayResult<Vec<Message>> {
        Ok(self
            .windows
            .get(id)
            .map(|window| window.value().clone())
            .unwrap_or_default())
    }

    async fn save(&self, id: &str, messages: &[Message]) -> GatewayResult<()> {
        self.windows.insert(id.to_string(), messages.to_vec());
        Ok(())
    }
}
