use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::base::{ChunkStream, Completion, CompletionChunk, ModelInvoker, Prompt, Usage};
use crate::errors::GatewayResult;

/// A mock invoker that plays back pre-configured outcomes, for testing
#[derive(Debug, Default)]
pub struct MockInvoker {
    responses: Mutex<VecDeque<GatewayResult<Completion>>>,
    chunks: Vec<GatewayResult<CompletionChunk>>,
    delay: Option<Duration>,
    prompts: Mutex<Vec<Prompt>>,
    invocations: AtomicUsize,
}

impl MockInvoker {
    /// Outcomes are returned in order, one per invocation. Once they run out every
    /// further call succeeds with an empty reply.
    pub fn new(responses: Vec<GatewayResult<Completion>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Default::default()
        }
    }

    pub fn replying<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            texts
                .into_iter()
                .map(|text| Ok(Completion::new(text, Usage::new(Some(1), Some(1), Some(2)), "mock")))
                .collect(),
        )
    }

    /// Chunks handed out by every streaming invocation
    pub fn with_stream(mut self, chunks: Vec<GatewayResult<CompletionChunk>>) -> Self {
        self.chunks = chunks;
        self
    }

    /// Sleep before answering, to exercise timeouts and concurrency
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times the terminal capability was reached (blocking and streaming)
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Every prompt received, in arrival order
    pub fn prompts(&self) -> Vec<Prompt> {
        lock(&self.prompts).clone()
    }

    async fn record(&self, prompt: &Prompt) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        lock(&self.prompts).push(prompt.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ModelInvoker for MockInvoker {
    async fn invoke(&self, prompt: &Prompt) -> GatewayResult<Completion> {
        self.record(prompt).await;
        lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| Ok(Completion::new("", Usage::default(), "mock")))
    }

    async fn invoke_stream(&self, prompt: &Prompt) -> GatewayResult<ChunkStream> {
        self.record(prompt).await;
        Ok(Box::pin(futures::stream::iter(self.chunks.clone())))
    }
}
