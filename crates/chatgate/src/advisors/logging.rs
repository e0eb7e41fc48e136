use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::chain::{Advisor, CallChain, StreamChain};
use super::context::ChatRequest;
use crate::errors::{GatewayError, GatewayResult};
use crate::models::role::Role;
use crate::providers::base::{ChunkStream, Completion, Usage};
use crate::utils::truncate_chars;

const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Off,
    #[default]
    Summary,
    /// Summary lines plus truncated message bodies at debug level
    Detailed,
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verbosity::Off => write!(f, "off"),
            Verbosity::Summary => write!(f, "summary"),
            Verbosity::Detailed => write!(f, "detailed"),
        }
    }
}

impl FromStr for Verbosity {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(Verbosity::Off),
            "summary" => Ok(Verbosity::Summary),
            "detailed" | "debug" => Ok(Verbosity::Detailed),
            other => Err(GatewayError::Config(format!(
                "unknown logging verbosity `{}`",
                other
            ))),
        }
    }
}

/// Logs a summary of each request and its outcome. Never touches the exchange itself.
#[derive(Debug, Clone, Default)]
pub struct LoggingAdvisor {
    verbosity: Verbosity,
}

impl LoggingAdvisor {
    pub const DEFAULT_ORDER: i32 = 0;

    pub fn new(verbosity: Verbosity) -> Self {
        Self { verbosity }
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    fn log_request(&self, request: &ChatRequest) {
        let context = &request.context;
        tracing::info!(
            request_id = %context.request_id(),
            conversation_id = context.conversation_id(),
            received_at = %context.started_at().to_rfc3339(),
            messages = request.prompt.messages.len(),
            "Chat request received"
        );

        if self.verbosity == Verbosity::Detailed {
            let user_message = request
                .prompt
                .messages
                .iter()
                .rev()
                .find(|message| message.role() == Role::User)
                .map(|message| truncate_chars(message.content(), PREVIEW_CHARS))
                .unwrap_or_else(|| "No user message".to_string());
            tracing::debug!(request_id = %context.request_id(), "User message: {}", user_message);

            let attributes = context.attributes();
            if !attributes.is_empty() {
                tracing::debug!(request_id = %context.request_id(), ?attributes, "Advisor context");
            }
        }
    }

    fn log_response(&self, request: &ChatRequest, completion: &Completion) {
        let context = &request.context;
        tracing::info!(
            request_id = %context.request_id(),
            duration_ms = context.elapsed().as_millis() as u64,
            model = %completion.model,
            attempts = context.attempts().unwrap_or(1),
            "Chat response generated"
        );

        if self.verbosity == Verbosity::Detailed {
            tracing::debug!(
                request_id = %context.request_id(),
                "Assistant message: {}",
                truncate_chars(&completion.text, PREVIEW_CHARS)
            );
            log_usage(request, &completion.usage);
        }
    }
}

fn log_usage(request: &ChatRequest, usage: &Usage) {
    if usage.is_empty() {
        return;
    }
    tracing::debug!(
        request_id = %request.context.request_id(),
        prompt_tokens = ?usage.input_tokens,
        completion_tokens = ?usage.output_tokens,
        total_tokens = ?usage.total_tokens,
        "Token usage"
    );
}

fn log_failure(request: &ChatRequest, error: &GatewayError, what: &str) {
    let context = &request.context;
    tracing::error!(
        request_id = %context.request_id(),
        duration_ms = context.elapsed().as_millis() as u64,
        attempts = context.attempts().unwrap_or(1),
        category = error.category().as_str(),
        error = %error,
        "{} failed",
        what
    );
}

#[async_trait]
impl Advisor for LoggingAdvisor {
    fn name(&self) -> &str {
        "logging"
    }

    async fn advise_call(&self, request: ChatRequest, next: CallChain) -> GatewayResult<Completion> {
        if self.verbosity == Verbosity::Off {
            return next.call(request).await;
        }

        self.log_request(&request);
        match next.call(request.clone()).await {
            Ok(completion) => {
                self.log_response(&request, &completion);
                Ok(completion)
            }
            Err(e) => {
                log_failure(&request, &e, "Chat request");
                Err(e)
            }
        }
    }

    async fn advise_stream(&self, request: ChatRequest, next: StreamChain) -> GatewayResult<ChunkStream> {
        if self.verbosity == Verbosity::Off {
            return next.stream(request).await;
        }

        self.log_request(&request);
        let mut inner = match next.stream(request.clone()).await {
            Ok(inner) => inner,
            Err(e) => {
                log_failure(&request, &e, "Chat stream");
                return Err(e);
            }
        };

        let detailed = self.verbosity == Verbosity::Detailed;
        let logged = stream! {
            let mut chunks = 0usize;
            while let Some(item) = inner.next().await {
                match &item {
                    Ok(chunk) => {
                        chunks += 1;
                        if detailed {
                            if let Some(usage) = &chunk.usage {
                                log_usage(&request, usage);
                            }
                        }
                    }
                    Err(e) => log_failure(&request, e, "Chat stream"),
                }
                let failed = item.is_err();
                yield item;
                if failed {
                    return;
                }
            }
            tracing::info!(
                request_id = %request.context.request_id(),
                duration_ms = request.context.elapsed().as_millis() as u64,
                chunks,
                "Chat stream completed"
            );
        };
        Ok(Box::pin(logged))
    }
}
