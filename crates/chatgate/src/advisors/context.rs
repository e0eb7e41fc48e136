use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::providers::base::Prompt;

/// Attribute holding the 1-based attempt number of the current model call
pub const ATTEMPTS_ATTRIBUTE: &str = "retry.attempts";

/// Per-request state shared by every advisor in a chain.
///
/// Clones share the same attribute map, so a value recorded by an inner advisor
/// (e.g. the retry attempt count) is visible to the outer ones once the call unwinds.
#[derive(Debug, Clone)]
pub struct AdvisorContext {
    request_id: Uuid,
    conversation_id: String,
    started_at: DateTime<Utc>,
    started: Instant,
    attributes: Arc<Mutex<HashMap<String, Value>>>,
}

impl AdvisorContext {
    pub fn new<S: Into<String>>(conversation_id: S) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            conversation_id: conversation_id.into(),
            started_at: Utc::now(),
            started: Instant::now(),
            attributes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn set_attribute<K: Into<String>, V: Into<Value>>(&self, key: K, value: V) {
        self.lock().insert(key.into(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    pub fn attributes(&self) -> HashMap<String, Value> {
        self.lock().clone()
    }

    /// Attempts made against the model so far, if a retry advisor is in the chain
    pub fn attempts(&self) -> Option<u32> {
        self.attribute(ATTEMPTS_ATTRIBUTE)
            .and_then(|value| value.as_u64())
            .map(|value| value as u32)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        // A panic while holding this lock cannot leave the map half-written
        self.attributes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// What travels down the chain: the prompt plus the context that follows it
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub context: AdvisorContext,
    pub prompt: Prompt,
}

impl ChatRequest {
    pub fn new(context: AdvisorContext, prompt: Prompt) -> Self {
        Self { context, prompt }
    }
}
