use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::store::ConversationStore;
use crate::errors::{GatewayError, GatewayResult};
use crate::models::message::Message;

/// The retained window of a single conversation, oldest message first
#[derive(Debug, Clone)]
pub struct Conversation {
    id: String,
    messages: VecDeque<Message>,
    max_window: usize,
    loaded: bool,
}

impl Conversation {
    pub fn new<S: Into<String>>(id: S, max_window: usize) -> Self {
        Self {
            id: id.into(),
            messages: VecDeque::new(),
            max_window,
            loaded: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn max_window(&self) -> usize {
        self.max_window
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }

    /// Append in order, then drop from the front until the window fits
    pub fn push(&mut self, message: Message) {
        self.messages.push_back(message);
        self.evict();
    }

    pub fn extend<I: IntoIterator<Item = Message>>(&mut self, messages: I) {
        for message in messages {
            self.push(message);
        }
    }

    fn evict(&mut self) {
        while self.messages.len() > self.max_window {
            self.messages.pop_front();
        }
    }
}

/// Exclusive access to one conversation. Held for the whole exchange so that
/// concurrent requests on the same id see each other's writes in arrival order.
pub struct ConversationGuard {
    conversation: OwnedMutexGuard<Conversation>,
    store: Option<Arc<dyn ConversationStore>>,
}

impl ConversationGuard {
    pub fn id(&self) -> &str {
        self.conversation.id()
    }

    /// Snapshot of the current window
    pub fn messages(&self) -> Vec<Message> {
        self.conversation.messages()
    }

    pub fn len(&self) -> usize {
        self.conversation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversation.is_empty()
    }

    /// Record a finished exchange, skipping blank messages. The in-process window is
    /// always updated; an error here only means the backing store could not be written.
    pub async fn commit<I: IntoIterator<Item = Message>>(
        &mut self,
        messages: I,
    ) -> GatewayResult<()> {
        self.conversation
            .extend(messages.into_iter().filter(|message| !message.is_blank()));
        if let Some(store) = &self.store {
            let snapshot = self.conversation.messages();
            store.save(self.conversation.id(), &snapshot).await?;
        }
        Ok(())
    }
}

/// Map of conversation id to window, with one lock per id
pub struct ConversationMemory {
    max_window: usize,
    conversations: DashMap<String, Arc<Mutex<Conversation>>>,
    store: Option<Arc<dyn ConversationStore>>,
}

impl ConversationMemory {
    pub fn new(max_window: usize) -> GatewayResult<Self> {
        if max_window == 0 {
            return Err(GatewayError::Config(
                "conversation window must hold at least one message".to_string(),
            ));
        }
        Ok(Self {
            max_window,
            conversations: DashMap::new(),
            store: None,
        })
    }

    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn max_window(&self) -> usize {
        self.max_window
    }

    /// Number of conversations seen by this process
    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    /// Wait for exclusive access to a conversation, creating it if the id is new
    pub async fn lock(&self, id: &str) -> GatewayResult<ConversationGuard> {
        // The map entry is released before awaiting so other ids are never held up
        let slot = self
            .conversations
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Conversation::new(id, self.max_window))))
            .value()
            .clone();

        let mut conversation = slot.lock_owned().await;
        if !conversation.loaded {
            if let Some(store) = &self.store {
                let stored = store.load(id).await?;
                conversation.extend(stored);
            }
            conversation.loaded = true;
        }

        Ok(ConversationGuard {
            conversation,
            store: self.store.clone(),
        })
    }

    pub async fn messages(&self, id: &str) -> GatewayResult<Vec<Message>> {
        Ok(self.lock(id).await?.messages())
    }

    pub async fn append<I: IntoIterator<Item = Message>>(
        &self,
        id: &str,
        messages: I,
    ) -> GatewayResult<()> {
        self.lock(id).await?.commit(messages).await
    }
}

impl std::fmt::Debug for ConversationMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationMemory")
            .field("max_window", &self.max_window)
            .field("conversations", &self.conversations.len())
            .field("store", &self.store.is_some())
            .finish()
    }
}
