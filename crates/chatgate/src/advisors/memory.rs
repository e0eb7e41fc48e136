use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;

use super::chain::{Advisor, CallChain, StreamChain};
use super::context::ChatRequest;
use crate::errors::GatewayResult;
use crate::memory::{ConversationGuard, ConversationMemory};
use crate::models::message::Message;
use crate::models::role::Role;
use crate::providers::base::{ChunkStream, Completion};

/// Prepends the stored conversation window to every request and records the exchange
/// once it has succeeded.
///
/// The conversation lock is held from the read until the write, across any retries
/// further in the chain, so requests on one id are applied strictly one after another.
#[derive(Debug, Clone)]
pub struct MemoryAdvisor {
    memory: Arc<ConversationMemory>,
}

impl MemoryAdvisor {
    pub const DEFAULT_ORDER: i32 = 75;

    pub fn new(memory: Arc<ConversationMemory>) -> Self {
        Self { memory }
    }

    pub fn memory(&self) -> &Arc<ConversationMemory> {
        &self.memory
    }
}

/// The window followed by the request's own messages
fn augment(request: &ChatRequest, guard: &ConversationGuard) -> ChatRequest {
    let mut augmented = request.clone();
    let mut messages = guard.messages();
    messages.extend(request.prompt.messages.iter().cloned());
    augmented.prompt.messages = messages;
    augmented
}

/// The turn this request contributes to memory: its last user message
fn user_turn(request: &ChatRequest) -> Option<Message> {
    request
        .prompt
        .messages
        .iter()
        .rev()
        .find(|message| message.role() == Role::User)
        .cloned()
}

async fn record(
    guard: &mut ConversationGuard,
    request: &ChatRequest,
    user: Option<Message>,
    reply: Message,
) {
    let reply = if reply.is_blank() {
        tracing::debug!(
            request_id = %request.context.request_id(),
            "Model returned an empty reply, remembering the user turn only"
        );
        None
    } else {
        Some(reply)
    };
    let exchange = user.into_iter().chain(reply);
    if let Err(e) = guard.commit(exchange).await {
        tracing::warn!(
            request_id = %request.context.request_id(),
            conversation_id = request.context.conversation_id(),
            error = %e,
            "Failed to persist conversation window"
        );
    }
}

#[async_trait]
impl Advisor for MemoryAdvisor {
    fn name(&self) -> &str {
        "memory"
    }

    async fn advise_call(&self, request: ChatRequest, next: CallChain) -> GatewayResult<Completion> {
        let mut guard = self.memory.lock(request.context.conversation_id()).await?;
        tracing::debug!(
            request_id = %request.context.request_id(),
            conversation_id = request.context.conversation_id(),
            window = guard.len(),
            "Loaded conversation window"
        );

        let completion = next.call(augment(&request, &guard)).await?;
        record(&mut guard, &request, user_turn(&request), completion.message()).await;
        Ok(completion)
    }

    async fn advise_stream(&self, request: ChatRequest, next: StreamChain) -> GatewayResult<ChunkStream> {
        let mut guard = self.memory.lock(request.context.conversation_id()).await?;
        let mut inner = next.stream(augment(&request, &guard)).await?;
        let user = user_turn(&request);

        // The guard moves into the stream: the lock is released when the stream finishes
        // or is dropped, and only a stream that ran to completion is recorded.
        let stream = try_stream! {
            let mut reply = String::new();
            while let Some(chunk) = inner.next().await {
                let chunk = chunk?;
                reply.push_str(&chunk.text);
                yield chunk;
            }
            record(&mut guard, &request, user, Message::assistant(reply)).await;
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisors::chain::AdvisorChain;
    use crate::advisors::context::AdvisorContext;
    use crate::errors::GatewayError;
    use crate::providers::base::{CompletionChunk, Prompt, Usage};
    use crate::providers::mock::MockInvoker;

    fn request(conversation: &str, text: &str) -> ChatRequest {
        ChatRequest::new(
            AdvisorContext::new(conversation),
            Prompt::new("", vec![Message::user(text)]),
        )
    }

    fn setup(mock: MockInvoker, window: usize) -> (Arc<MockInvoker>, Arc<ConversationMemory>, AdvisorChain) {
        let mock = Arc::new(mock);
        let memory = Arc::new(ConversationMemory::new(window).unwrap());
        let chain = AdvisorChain::builder(mock.clone())
            .advisor(MemoryAdvisor::new(memory.clone()), MemoryAdvisor::DEFAULT_ORDER)
            .build();
        (mock, memory, chain)
    }

    #[tokio::test]
    async fn test_history_is_prepended() -> anyhow::Result<()> {
        let (mock, memory, chain) = setup(MockInvoker::replying(["first answer", "second answer"]), 10);

        chain.call(request("c", "first question")).await?;
        chain.call(request("c", "second question")).await?;

        let prompts = mock.prompts();
        assert_eq!(prompts[0].messages, vec![Message::user("first question")]);
        assert_eq!(
            prompts[1].messages,
            vec![
                Message::user("first question"),
                Message::assistant("first answer"),
                Message::user("second question"),
            ]
        );
        assert_eq!(memory.messages("c").await?.len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_call_leaves_memory_untouched() -> anyhow::Result<()> {
        let (_, memory, chain) = setup(
            MockInvoker::new(vec![Err(GatewayError::FatalUpstream("boom".to_string()))]),
            10,
        );

        assert!(chain.call(request("c", "question")).await.is_err());
        assert!(memory.messages("c").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_completed_stream_is_recorded() -> anyhow::Result<()> {
        let (_, memory, chain) = setup(
            MockInvoker::default().with_stream(vec![
                Ok(CompletionChunk::text("Hel")),
                Ok(CompletionChunk::text("lo")),
            ]),
            10,
        );

        let chunks: Vec<_> = chain.stream(request("c", "hi")).await?.collect().await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(
            memory.messages("c").await?,
            vec![Message::user("hi"), Message::assistant("Hello")]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_or_dropped_stream_is_not_recorded() -> anyhow::Result<()> {
        let (_, memory, chain) = setup(
            MockInvoker::default().with_stream(vec![
                Ok(CompletionChunk::text("partial")),
                Err(GatewayError::FatalUpstream("cut off".to_string())),
            ]),
            10,
        );

        let chunks: Vec<_> = chain.stream(request("c", "hi")).await?.collect().await;
        assert!(chunks[1].is_err());
        assert!(memory.messages("c").await?.is_empty());

        let mut stream = chain.stream(request("c", "hi again")).await?;
        assert!(stream.next().await.is_some());
        drop(stream);
        assert!(memory.messages("c").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_reply_keeps_only_the_user_turn() -> anyhow::Result<()> {
        let (_, memory, chain) = setup(MockInvoker::replying([""]), 10);

        assert_eq!(chain.call(request("c", "hi")).await?.text, "");
        assert_eq!(memory.messages("c").await?, vec![Message::user("hi")]);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_stream_keeps_only_the_user_turn() -> anyhow::Result<()> {
        let (_, memory, chain) = setup(
            MockInvoker::default().with_stream(vec![Ok(CompletionChunk::text(""))]),
            10,
        );

        let chunks: Vec<_> = chain.stream(request("c", "hi")).await?.collect().await;
        assert_eq!(chunks.len(), 1);
        let history = memory.messages("c").await?;
        assert_eq!(history, vec![Message::user("hi")]);
        assert!(history.iter().all(|m| !m.is_blank()));
        Ok(())
    }

    #[tokio::test]
    async fn test_completion_usage_passes_through() -> anyhow::Result<()> {
        let usage = Usage::new(Some(4), Some(6), Some(10));
        let (_, _, chain) = setup(
            MockInvoker::new(vec![Ok(Completion::new("ok", usage.clone(), "m"))]),
            4,
        );
        assert_eq!(chain.call(request("c", "hi")).await?.usage, usage);
        Ok(())
    }
}
