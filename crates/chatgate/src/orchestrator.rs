use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::advisors::{
    Advisor, AdvisorChain, AdvisorContext, ChatRequest, LoggingAdvisor, MemoryAdvisor,
    ObservationAdvisor, RetryAdvisor,
};
use crate::configuration::Settings;
use crate::errors::{GatewayError, GatewayResult};
use crate::memory::ConversationMemory;
use crate::models::message::{IncomingMessage, Message};
use crate::models::role::Role;
use crate::prompt::{FilePromptSource, StaticPrompt, SystemPromptSource};
use crate::providers::base::{ChatOptions, ChunkStream, Completion, ModelInvoker, Prompt};
use crate::providers::openai::OpenAiCompatibleInvoker;
use crate::structured::OutputShape;
use crate::telemetry;
use crate::tools::{ToolCallingInvoker, ToolProvider, ToolRegistry};

/// The public entry point: validates caller input, resolves the conversation and runs
/// the advisor chain.
pub struct CompletionOrchestrator {
    chain: AdvisorChain,
    prompt: Arc<dyn SystemPromptSource>,
    options: ChatOptions,
    memory: Option<Arc<ConversationMemory>>,
}

impl CompletionOrchestrator {
    pub fn builder(invoker: Arc<dyn ModelInvoker>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            invoker,
            advisors: Vec::new(),
            prompt: Arc::new(StaticPrompt::default()),
            options: ChatOptions::default(),
            memory: None,
            tools: None,
        }
    }

    /// Everything from configuration, talking to the configured OpenAI-compatible endpoint.
    /// Also installs the global tracing subscriber at `logging.level` unless one exists.
    pub fn from_settings(settings: &Settings) -> GatewayResult<Self> {
        settings.validate()?;
        telemetry::init_tracing(&settings.logging.level);
        let invoker = OpenAiCompatibleInvoker::new(settings.provider.clone().into_config())?;
        Self::from_settings_with(settings, Arc::new(invoker), Vec::new())
    }

    /// Like `from_settings`, with the terminal invoker and tool providers supplied by the caller
    pub fn from_settings_with(
        settings: &Settings,
        invoker: Arc<dyn ModelInvoker>,
        tool_providers: Vec<Arc<dyn ToolProvider>>,
    ) -> GatewayResult<Self> {
        settings.validate()?;
        let prompt: Arc<dyn SystemPromptSource> = match &settings.prompt.path {
            Some(path) => Arc::new(FilePromptSource::new(path)),
            None => Arc::new(StaticPrompt::default()),
        };

        let mut builder = Self::builder(invoker)
            .prompt_source(prompt)
            .timeout(settings.provider.timeout());

        if !tool_providers.is_empty() {
            let mut registry = ToolRegistry::new(settings.tools.timeout());
            for provider in tool_providers {
                registry.register(provider)?;
            }
            builder = builder.tools(Arc::new(registry), settings.tools.max_rounds);
        }
        if settings.logging.enabled {
            builder = builder.advisor(
                LoggingAdvisor::new(settings.logging.verbosity),
                LoggingAdvisor::DEFAULT_ORDER,
            );
        }
        if settings.observation.enabled {
            builder = builder.advisor(ObservationAdvisor::default(), ObservationAdvisor::DEFAULT_ORDER);
        }
        if settings.memory.enabled {
            builder = builder.memory(Arc::new(ConversationMemory::new(settings.memory.max_messages)?));
        }
        if settings.retry.enabled {
            builder = builder.advisor(
                RetryAdvisor::new(settings.retry.policy()?),
                RetryAdvisor::DEFAULT_ORDER,
            );
        }

        let orchestrator = builder.build();
        tracing::info!(advisors = ?orchestrator.chain.descriptors(), "Completion pipeline ready");
        Ok(orchestrator)
    }

    pub fn chain(&self) -> &AdvisorChain {
        &self.chain
    }

    pub fn memory(&self) -> Option<&Arc<ConversationMemory>> {
        self.memory.as_ref()
    }

    pub fn prompt_source(&self) -> &Arc<dyn SystemPromptSource> {
        &self.prompt
    }

    /// Generate a reply and return its text
    pub async fn complete(
        &self,
        conversation_id: Option<&str>,
        messages: Vec<Message>,
    ) -> GatewayResult<String> {
        Ok(self.complete_detailed(conversation_id, messages).await?.text)
    }

    /// Generate a reply, keeping model id and token usage
    pub async fn complete_detailed(
        &self,
        conversation_id: Option<&str>,
        messages: Vec<Message>,
    ) -> GatewayResult<Completion> {
        let request = self.prepare(conversation_id, messages)?;
        self.chain.call(request).await
    }

    /// Stream the reply as it is generated
    pub async fn complete_streaming(
        &self,
        conversation_id: Option<&str>,
        messages: Vec<Message>,
    ) -> GatewayResult<ChunkStream> {
        let request = self.prepare(conversation_id, messages)?;
        self.chain.stream(request).await
    }

    /// Ask for a reply shaped like `shape` and return it once every field checks out
    pub async fn complete_structured(
        &self,
        conversation_id: Option<&str>,
        messages: Vec<Message>,
        shape: &OutputShape,
    ) -> GatewayResult<Value> {
        let mut request = self.prepare(conversation_id, messages)?;
        let instructions = shape.format_instructions()?;
        request.prompt.system = if request.prompt.system.trim().is_empty() {
            instructions
        } else {
            format!("{}\n\n{}", request.prompt.system, instructions)
        };

        let completion = self.chain.call(request).await?;
        shape.parse(&completion.text).map_err(|e| {
            tracing::error!(shape = shape.name(), error = %e, "Structured output mapping failed");
            e
        })
    }

    pub async fn complete_typed<T: DeserializeOwned>(
        &self,
        conversation_id: Option<&str>,
        messages: Vec<Message>,
        shape: &OutputShape,
    ) -> GatewayResult<T> {
        let value = self
            .complete_structured(conversation_id, messages, shape)
            .await?;
        shape.convert(value)
    }

    /// `complete`, abandoned as soon as `cancel` resolves. A cancelled request makes no
    /// further model attempts and leaves conversation memory untouched.
    pub async fn complete_until<F>(
        &self,
        conversation_id: Option<&str>,
        messages: Vec<Message>,
        cancel: F,
    ) -> GatewayResult<String>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = cancel => {
                tracing::info!("Chat request cancelled by caller");
                Err(GatewayError::Cancelled)
            }
            result = self.complete(conversation_id, messages) => result,
        }
    }

    /// Validate raw caller messages. Blank and unknown-role messages are skipped.
    pub fn parse_incoming(messages: Vec<IncomingMessage>) -> GatewayResult<Vec<Message>> {
        if messages.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "request must contain at least one message".to_string(),
            ));
        }

        let mut parsed = Vec::with_capacity(messages.len());
        for incoming in messages {
            let content = incoming.content.unwrap_or_default();
            if content.trim().is_empty() {
                tracing::warn!(role = %incoming.role, "Skipping message with empty content");
                continue;
            }
            match incoming.role.parse::<Role>() {
                Ok(role) => parsed.push(Message::new(role, content)),
                Err(_) => tracing::warn!(role = %incoming.role, "Skipping message with unknown role"),
            }
        }

        if parsed.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "request contains no usable messages".to_string(),
            ));
        }
        Ok(parsed)
    }

    /// `complete` for raw caller messages
    pub async fn complete_incoming(
        &self,
        conversation_id: Option<&str>,
        messages: Vec<IncomingMessage>,
    ) -> GatewayResult<String> {
        self.complete(conversation_id, Self::parse_incoming(messages)?)
            .await
    }

    fn prepare(
        &self,
        conversation_id: Option<&str>,
        messages: Vec<Message>,
    ) -> GatewayResult<ChatRequest> {
        if messages.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "request must contain at least one message".to_string(),
            ));
        }

        let received = messages.len();
        let non_blank: Vec<Message> = messages
            .into_iter()
            .filter(|message| {
                if message.is_blank() {
                    tracing::warn!(role = %message.role(), "Skipping message with empty content");
                }
                !message.is_blank()
            })
            .collect();
        if non_blank.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "every message in the request is blank".to_string(),
            ));
        }

        // Prior assistant turns come from conversation memory, not from the caller
        let forwarded: Vec<Message> = non_blank
            .into_iter()
            .filter(|message| {
                if message.role() == Role::Assistant {
                    tracing::debug!("Assistant message in request left to conversation memory");
                }
                message.role() != Role::Assistant
            })
            .collect();
        if forwarded.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "request contains no user or system message".to_string(),
            ));
        }

        let conversation_id = match conversation_id.map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };

        let context = AdvisorContext::new(conversation_id);
        tracing::debug!(
            request_id = %context.request_id(),
            conversation_id = context.conversation_id(),
            received,
            forwarded = forwarded.len(),
            "Processing chat request"
        );

        let prompt = Prompt::new(self.prompt.prompt(), forwarded).with_options(self.options.clone());
        Ok(ChatRequest::new(context, prompt))
    }
}

impl std::fmt::Debug for CompletionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionOrchestrator")
            .field("chain", &self.chain)
            .field("options", &self.options)
            .field("memory", &self.memory)
            .finish()
    }
}

pub struct OrchestratorBuilder {
    invoker: Arc<dyn ModelInvoker>,
    advisors: Vec<(Arc<dyn Advisor>, i32)>,
    prompt: Arc<dyn SystemPromptSource>,
    options: ChatOptions,
    memory: Option<Arc<ConversationMemory>>,
    tools: Option<(Arc<ToolRegistry>, usize)>,
}

impl OrchestratorBuilder {
    pub fn advisor<A: Advisor + 'static>(self, advisor: A, order: i32) -> Self {
        self.shared_advisor(Arc::new(advisor), order)
    }

    pub fn shared_advisor(mut self, advisor: Arc<dyn Advisor>, order: i32) -> Self {
        self.advisors.push((advisor, order));
        self
    }

    /// Keep conversation memory, consulted by a `MemoryAdvisor` at its default order
    pub fn memory(mut self, memory: Arc<ConversationMemory>) -> Self {
        self.memory = Some(Arc::clone(&memory));
        self.advisor(MemoryAdvisor::new(memory), MemoryAdvisor::DEFAULT_ORDER)
    }

    pub fn system_prompt<S: Into<String>>(self, prompt: S) -> Self {
        self.prompt_source(Arc::new(StaticPrompt::new(prompt)))
    }

    pub fn prompt_source(mut self, prompt: Arc<dyn SystemPromptSource>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    /// Budget for each terminal invocation
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub fn tools(mut self, registry: Arc<ToolRegistry>, max_rounds: usize) -> Self {
        self.tools = Some((registry, max_rounds));
        self
    }

    pub fn build(self) -> CompletionOrchestrator {
        let terminal: Arc<dyn ModelInvoker> = match self.tools {
            Some((registry, max_rounds)) => {
                Arc::new(ToolCallingInvoker::new(self.invoker, registry, max_rounds))
            }
            None => self.invoker,
        };

        let chain = self
            .advisors
            .into_iter()
            .fold(AdvisorChain::builder(terminal), |builder, (advisor, order)| {
                builder.shared(advisor, order)
            })
            .build();

        CompletionOrchestrator {
            chain,
            prompt: self.prompt,
            options: self.options,
            memory: self.memory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::MockInvoker;

    fn orchestrator(mock: &Arc<MockInvoker>) -> CompletionOrchestrator {
        CompletionOrchestrator::builder(mock.clone())
            .system_prompt("Be brief.")
            .memory(Arc::new(ConversationMemory::new(10).unwrap()))
            .build()
    }

    #[tokio::test]
    async fn test_empty_request_is_invalid() {
        let mock = Arc::new(MockInvoker::replying(["unused"]));
        let err = orchestrator(&mock).complete(None, vec![]).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));

        let err = orchestrator(&mock)
            .complete(None, vec![Message::user("  "), Message::user("")])
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
        assert_eq!(mock.invocations(), 0);
    }

    #[tokio::test]
    async fn test_prompt_carries_system_prompt_and_drops_assistant_turns() -> anyhow::Result<()> {
        let mock = Arc::new(MockInvoker::replying(["ok"]));
        orchestrator(&mock)
            .complete(
                Some("c"),
                vec![
                    Message::system("Use metric units."),
                    Message::assistant("stale reply"),
                    Message::user("How warm is it?"),
                ],
            )
            .await?;

        let prompt = &mock.prompts()[0];
        assert_eq!(prompt.system, "Be brief.");
        assert_eq!(
            prompt.messages,
            vec![Message::system("Use metric units."), Message::user("How warm is it?")]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_conversation_id_is_synthesized() -> anyhow::Result<()> {
        let mock = Arc::new(MockInvoker::replying(["a", "b"]));
        let orchestrator = orchestrator(&mock);
        orchestrator.complete(None, vec![Message::user("one")]).await?;
        orchestrator.complete(Some("  "), vec![Message::user("two")]).await?;

        let memory = orchestrator.memory().unwrap();
        assert_eq!(memory.conversation_count(), 2);
        // Fresh ids never see each other's history
        assert_eq!(mock.prompts()[1].messages, vec![Message::user("two")]);
        Ok(())
    }

    #[test]
    fn test_parse_incoming() {
        let parsed = CompletionOrchestrator::parse_incoming(vec![
            IncomingMessage::new("USER", "hello"),
            IncomingMessage::new("tool", "ignored"),
            IncomingMessage {
                role: "user".to_string(),
                content: None,
            },
            IncomingMessage::new("system", "be nice"),
        ])
        .unwrap();
        assert_eq!(parsed, vec![Message::user("hello"), Message::system("be nice")]);

        assert!(CompletionOrchestrator::parse_incoming(vec![]).is_err());
        assert!(
            CompletionOrchestrator::parse_incoming(vec![IncomingMessage::new("bot", "x")]).is_err()
        );
    }

    #[tokio::test]
    async fn test_from_settings_wires_enabled_advisors() -> anyhow::Result<()> {
        let mut settings = Settings::default();
        settings.provider.api_key = "gsk_abcdefghijklmnopqrstuvwxyz".to_string();
        settings.observation.enabled = false;
        let mock = Arc::new(MockInvoker::replying(["ok"]));

        let orchestrator = CompletionOrchestrator::from_settings_with(&settings, mock, Vec::new())?;
        let names: Vec<String> = orchestrator
            .chain()
            .descriptors()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["logging", "memory", "retry"]);
        assert_eq!(orchestrator.memory().map(|m| m.max_window()), Some(20));
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_settings_are_rejected() {
        let mock = Arc::new(MockInvoker::replying(["unused"]));

        let mut settings = Settings::default();
        settings.provider.api_key = "REPLACE_ME".to_string();
        let err = CompletionOrchestrator::from_settings_with(&settings, mock.clone(), Vec::new())
            .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));

        settings.provider.api_key = "gsk_abcdefghijklmnopqrstuvwxyz".to_string();
        settings.provider.temperature = 3.5;
        let err = CompletionOrchestrator::from_settings_with(&settings, mock, Vec::new())
            .unwrap_err();
        assert!(err.to_string().contains("temperature"));
    }

    #[tokio::test]
    async fn test_from_settings_builds_http_pipeline() -> anyhow::Result<()> {
        let mut settings = Settings::default();
        settings.provider.api_key = "gsk_abcdefghijklmnopqrstuvwxyz".to_string();
        settings.logging.level = "debug".to_string();

        let orchestrator = CompletionOrchestrator::from_settings(&settings)?;
        assert_eq!(orchestrator.chain().len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_complete_until_cancelled() {
        let mock = Arc::new(MockInvoker::replying(["slow"]).with_delay(Duration::from_secs(5)));
        let orchestrator = orchestrator(&mock);

        let err = orchestrator
            .complete_until(
                Some("c"),
                vec![Message::user("hi")],
                tokio::time::sleep(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Cancelled);
        let memory = orchestrator.memory().unwrap();
        assert!(memory.messages("c").await.unwrap().is_empty());
    }
}
