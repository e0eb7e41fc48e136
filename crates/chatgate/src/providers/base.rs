use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::GatewayResult;
use crate::models::message::Message;
use crate::models::tool::{Tool, ToolCall, ToolRound};

pub const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub total_tokens: Option<i32>,
}

impl Usage {
    pub fn new(
        input_tokens: Option<i32>,
        output_tokens: Option<i32>,
        total_tokens: Option<i32>,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none() && self.output_tokens.is_none() && self.total_tokens.is_none()
    }

    /// Add another usage report on top of this one, treating missing counts as unknown
    pub fn accumulate(&mut self, other: &Usage) {
        fn add(a: Option<i32>, b: Option<i32>) -> Option<i32> {
            match (a, b) {
                (Some(a), Some(b)) => Some(a.saturating_add(b)),
                (a, b) => a.or(b),
            }
        }
        self.input_tokens = add(self.input_tokens, other.input_tokens);
        self.output_tokens = add(self.output_tokens, other.output_tokens);
        self.total_tokens = add(self.total_tokens, other.total_tokens);
    }
}

/// Per-invocation options passed through to the model
#[derive(Debug, Clone, PartialEq)]
pub struct ChatOptions {
    /// Overrides the invoker's configured model
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
    pub tools: Vec<Tool>,
    /// Upper bound for a single terminal invocation; exceeding it is a retryable timeout
    pub timeout: Duration,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            model: None,
            temperature: None,
            max_tokens: None,
            tools: Vec::new(),
            timeout: DEFAULT_INVOCATION_TIMEOUT,
        }
    }
}

impl ChatOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Everything the model sees for one invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub messages: Vec<Message>,
    pub options: ChatOptions,
    pub tool_rounds: Vec<ToolRound>,
}

impl Prompt {
    pub fn new<S: Into<String>>(system: S, messages: Vec<Message>) -> Self {
        Self {
            system: system.into(),
            messages,
            options: ChatOptions::default(),
            tool_rounds: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }
}

/// The result of a blocking model invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
    pub model: String,
    pub tool_calls: Vec<ToolCall>,
}

impl Completion {
    pub fn new<T: Into<String>, M: Into<String>>(text: T, usage: Usage, model: M) -> Self {
        Self {
            text: text.into(),
            usage,
            model: model.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn message(&self) -> Message {
        Message::assistant(self.text.clone())
    }
}

/// One piece of a streamed reply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionChunk {
    pub text: String,
    /// Usage is typically only reported on the final chunk
    pub usage: Option<Usage>,
    pub model: Option<String>,
}

impl CompletionChunk {
    pub fn text<S: Into<String>>(text: S) -> Self {
        Self {
            text: text.into(),
            usage: None,
            model: None,
        }
    }
}

/// An ordered, finite, non-restartable sequence of chunks ending in completion or an error
pub type ChunkStream = BoxStream<'static, GatewayResult<CompletionChunk>>;

/// The terminal capability that actually produces a completion
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    /// Generate the full reply for the prompt
    async fn invoke(&self, prompt: &Prompt) -> GatewayResult<Completion>;

    /// Open a chunk stream for the prompt. Chunks are produced as the consumer pulls them.
    async fn invoke_stream(&self, prompt: &Prompt) -> GatewayResult<ChunkStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use serde_json::json;

    #[test]
    fn test_usage_creation() {
        let usage = Usage::new(Some(10), Some(20), Some(30));
        assert_eq!(usage.input_tokens, Some(10));
        assert_eq!(usage.output_tokens, Some(20));
        assert_eq!(usage.total_tokens, Some(30));
        assert!(!usage.is_empty());
        assert!(Usage::default().is_empty());
    }

    #[test]
    fn test_usage_accumulate() {
        let mut usage = Usage::new(Some(10), None, Some(10));
        usage.accumulate(&Usage::new(Some(5), Some(7), None));
        assert_eq!(usage, Usage::new(Some(15), Some(7), Some(10)));

        let mut large = Usage::new(Some(i32::MAX - 1), None, Some(i32::MAX));
        large.accumulate(&Usage::new(Some(5), None, Some(1)));
        assert_eq!(large, Usage::new(Some(i32::MAX), None, Some(i32::MAX)));
    }

    #[test]
    fn test_usage_serialization() -> Result<()> {
        let usage = Usage::new(Some(10), Some(20), Some(30));
        let serialized = serde_json::to_string(&usage)?;
        let json_value: serde_json::Value = serde_json::from_str(&serialized)?;
        assert_eq!(json_value["input_tokens"], json!(10));
        assert_eq!(json_value["output_tokens"], json!(20));
        assert_eq!(json_value["total_tokens"], json!(30));
        Ok(())
    }

    #[test]
    fn test_default_options_carry_timeout() {
        let options = ChatOptions::default();
        assert_eq!(options.timeout, DEFAULT_INVOCATION_TIMEOUT);
        let options = options.with_timeout(Duration::from_millis(5));
        assert_eq!(options.timeout, Duration::from_millis(5));
    }
}
