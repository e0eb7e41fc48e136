//! Externally supplied tools and the loop that lets a model call them.
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{GatewayError, GatewayResult};
use crate::models::tool::{Tool, ToolCall, ToolRound};
use crate::providers::base::{ChunkStream, Completion, ModelInvoker, Prompt, Usage};
use crate::providers::utils::sanitize_function_name;
use crate::utils::truncate_chars;

const INPUT_SUMMARY_CHARS: usize = 120;

/// A capability exposing zero or more tools to the model
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn name(&self) -> &str;

    fn tools(&self) -> Vec<Tool>;

    /// Run one of this provider's tools. The output is handed back to the model verbatim.
    async fn execute(&self, tool: &str, input: Value) -> anyhow::Result<String>;
}

struct Entry {
    provider: usize,
    tool: Tool,
}

/// Every tool from every registered provider, addressable by the name the model sees
pub struct ToolRegistry {
    providers: Vec<Arc<dyn ToolProvider>>,
    entries: HashMap<String, Entry>,
    order: Vec<String>,
    timeout: Duration,
}

impl ToolRegistry {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(timeout: Duration) -> Self {
        Self {
            providers: Vec::new(),
            entries: HashMap::new(),
            order: Vec::new(),
            timeout,
        }
    }

    /// Add a provider. Fails without registering anything if one of its tools collides
    /// with a tool that is already known.
    pub fn register(&mut self, provider: Arc<dyn ToolProvider>) -> GatewayResult<()> {
        let tools = provider.tools();
        let mut names = Vec::with_capacity(tools.len());
        for tool in &tools {
            let name = sanitize_function_name(&tool.name);
            if self.entries.contains_key(&name) || names.contains(&name) {
                return Err(GatewayError::InvalidRequest(format!(
                    "Duplicate tool name `{}` from provider `{}`",
                    tool.name,
                    provider.name()
                )));
            }
            names.push(name);
        }

        let index = self.providers.len();
        for (name, tool) in names.into_iter().zip(tools) {
            self.order.push(name.clone());
            self.entries.insert(name, Entry { provider: index, tool });
        }
        tracing::debug!(provider = provider.name(), tools = self.order.len(), "Registered tool provider");
        self.providers.push(provider);
        Ok(())
    }

    pub fn with_provider(mut self, provider: Arc<dyn ToolProvider>) -> GatewayResult<Self> {
        self.register(provider)?;
        Ok(self)
    }

    /// Tools in registration order
    pub fn tools(&self) -> Vec<Tool> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name))
            .map(|entry| entry.tool.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run a tool call, bounded by the registry timeout
    pub async fn execute(&self, call: &ToolCall) -> GatewayResult<String> {
        let failure = |message: String| GatewayError::ToolExecution {
            tool: call.name.clone(),
            input: truncate_chars(&call.arguments.to_string(), INPUT_SUMMARY_CHARS),
            message,
        };

        let entry = self
            .entries
            .get(&call.name)
            .ok_or_else(|| failure("no such tool".to_string()))?;
        let provider = &self.providers[entry.provider];

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            self.timeout,
            provider.execute(&entry.tool.name, call.arguments.clone()),
        )
        .await;

        match result {
            Ok(Ok(output)) => {
                tracing::debug!(
                    tool = %call.name,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Tool call finished"
                );
                Ok(output)
            }
            Ok(Err(e)) => Err(failure(format!("{:#}", e))),
            Err(_) => Err(failure(format!(
                "timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TIMEOUT)
    }
}

/// Wraps a terminal invoker so the model may call registry tools before answering.
///
/// Only the blocking path runs tools; streams go straight to the inner invoker.
pub struct ToolCallingInvoker {
    inner: Arc<dyn ModelInvoker>,
    registry: Arc<ToolRegistry>,
    max_rounds: usize,
}

impl ToolCallingInvoker {
    pub const DEFAULT_MAX_ROUNDS: usize = 5;

    pub fn new(inner: Arc<dyn ModelInvoker>, registry: Arc<ToolRegistry>, max_rounds: usize) -> Self {
        Self {
            inner,
            registry,
            max_rounds,
        }
    }
}

#[async_trait]
impl ModelInvoker for ToolCallingInvoker {
    async fn invoke(&self, prompt: &Prompt) -> GatewayResult<Completion> {
        if self.registry.is_empty() {
            return self.inner.invoke(prompt).await;
        }

        let mut prompt = prompt.clone();
        prompt.options.tools.extend(self.registry.tools());
        let mut usage = Usage::default();
        let mut rounds = 0;

        loop {
            let mut completion = self.inner.invoke(&prompt).await?;
            usage.accumulate(&completion.usage);

            if completion.tool_calls.is_empty() {
                completion.usage = usage;
                return Ok(completion);
            }
            if rounds == self.max_rounds {
                return Err(GatewayError::FatalUpstream(format!(
                    "model kept requesting tools after {} rounds",
                    self.max_rounds
                )));
            }

            // All calls of a round run concurrently, results keep the model's order
            let calls = std::mem::take(&mut completion.tool_calls);
            let outputs =
                futures::future::join_all(calls.iter().map(|call| self.registry.execute(call)))
                    .await;
            for (call, output) in calls.into_iter().zip(outputs) {
                prompt.tool_rounds.push(ToolRound {
                    call,
                    output: output?,
                });
            }
            rounds += 1;
        }
    }

    async fn invoke_stream(&self, prompt: &Prompt) -> GatewayResult<ChunkStream> {
        self.inner.invoke_stream(prompt).await
    }
}
