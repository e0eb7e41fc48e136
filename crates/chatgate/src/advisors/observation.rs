use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::chain::{Advisor, CallChain, StreamChain};
use super::context::{AdvisorContext, ChatRequest};
use crate::errors::{ErrorCategory, GatewayError, GatewayResult};
use crate::providers::base::{ChunkStream, Completion, CompletionChunk, Usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationMode {
    Call,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationPhase {
    Started,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Error,
    Cancelled,
}

/// One structured event about a request or stream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub request_id: Uuid,
    pub conversation_id: String,
    pub mode: ObservationMode,
    pub phase: ObservationPhase,
    pub outcome: Option<Outcome>,
    pub error_category: Option<ErrorCategory>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub model: Option<String>,
    pub usage: Option<Usage>,
    pub attempts: Option<u32>,
    /// Chunks delivered, streams only
    pub chunks: Option<usize>,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

impl Observation {
    fn new(context: &AdvisorContext, mode: ObservationMode, phase: ObservationPhase) -> Self {
        Self {
            request_id: context.request_id(),
            conversation_id: context.conversation_id().to_string(),
            mode,
            phase,
            outcome: None,
            error_category: None,
            duration: Duration::ZERO,
            model: None,
            usage: None,
            attempts: context.attempts(),
            chunks: None,
        }
    }

    fn finished(
        context: &AdvisorContext,
        mode: ObservationMode,
        outcome: Outcome,
        duration: Duration,
    ) -> Self {
        Self {
            outcome: Some(outcome),
            duration,
            ..Self::new(context, mode, ObservationPhase::Finished)
        }
    }
}

/// Destination for observations
pub trait ObservationEmitter: Send + Sync {
    fn emit(&self, observation: &Observation) -> GatewayResult<()>;
}

/// Writes every observation as a structured event on the `chatgate::observation` target
#[derive(Debug, Clone, Default)]
pub struct TracingEmitter;

impl ObservationEmitter for TracingEmitter {
    fn emit(&self, observation: &Observation) -> GatewayResult<()> {
        let usage = observation.usage.clone().unwrap_or_default();
        tracing::info!(
            target: "chatgate::observation",
            request_id = %observation.request_id,
            conversation_id = %observation.conversation_id,
            mode = ?observation.mode,
            phase = ?observation.phase,
            outcome = ?observation.outcome,
            error_category = observation.error_category.map(ErrorCategory::as_str),
            duration_ms = observation.duration.as_millis() as u64,
            model = observation.model.as_deref(),
            prompt_tokens = usage.input_tokens,
            completion_tokens = usage.output_tokens,
            total_tokens = usage.total_tokens,
            attempts = observation.attempts,
            chunks = observation.chunks,
            "observation"
        );
        Ok(())
    }
}

/// Hand an observation to the emitter; nothing it does can fail the request
fn emit_guarded(emitter: &dyn ObservationEmitter, observation: &Observation) {
    match catch_unwind(AssertUnwindSafe(|| emitter.emit(observation))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let e = match e {
                GatewayError::Observation(_) => e,
                other => GatewayError::Observation(other.to_string()),
            };
            tracing::warn!(request_id = %observation.request_id, error = %e, "Dropped observation");
        }
        Err(_) => {
            tracing::warn!(request_id = %observation.request_id, "Observation emitter panicked");
        }
    }
}

/// Emits one event per blocking request, and a start plus a single terminal event per stream
#[derive(Clone)]
pub struct ObservationAdvisor {
    emitter: Arc<dyn ObservationEmitter>,
}

impl ObservationAdvisor {
    pub const DEFAULT_ORDER: i32 = 50;

    pub fn new(emitter: Arc<dyn ObservationEmitter>) -> Self {
        Self { emitter }
    }
}

impl Default for ObservationAdvisor {
    fn default() -> Self {
        Self::new(Arc::new(TracingEmitter))
    }
}

impl std::fmt::Debug for ObservationAdvisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservationAdvisor").finish_non_exhaustive()
    }
}

#[async_trait]
impl Advisor for ObservationAdvisor {
    fn name(&self) -> &str {
        "observation"
    }

    async fn advise_call(&self, request: ChatRequest, next: CallChain) -> GatewayResult<Completion> {
        let started = Instant::now();
        let context = request.context.clone();
        let result = next.call(request).await;

        let observation = match &result {
            Ok(completion) => Observation {
                model: Some(completion.model.clone()),
                usage: Some(completion.usage.clone()),
                ..Observation::finished(&context, ObservationMode::Call, Outcome::Success, started.elapsed())
            },
            Err(e) => Observation {
                error_category: Some(e.category()),
                ..Observation::finished(&context, ObservationMode::Call, Outcome::Error, started.elapsed())
            },
        };
        emit_guarded(self.emitter.as_ref(), &observation);
        result
    }

    async fn advise_stream(&self, request: ChatRequest, next: StreamChain) -> GatewayResult<ChunkStream> {
        let started = Instant::now();
        let context = request.context.clone();
        emit_guarded(
            self.emitter.as_ref(),
            &Observation::new(&context, ObservationMode::Stream, ObservationPhase::Started),
        );

        match next.stream(request).await {
            Ok(inner) => Ok(Box::pin(ObservedStream {
                inner,
                emitter: Arc::clone(&self.emitter),
                context,
                started,
                chunks: 0,
                model: None,
                usage: None,
                finished: false,
            })),
            Err(e) => {
                let observation = Observation {
                    error_category: Some(e.category()),
                    chunks: Some(0),
                    ..Observation::finished(&context, ObservationMode::Stream, Outcome::Error, started.elapsed())
                };
                emit_guarded(self.emitter.as_ref(), &observation);
                Err(e)
            }
        }
    }
}

/// Passes chunks through untouched and reports how the stream ended, including being
/// dropped by its consumer before the end.
struct ObservedStream {
    inner: ChunkStream,
    emitter: Arc<dyn ObservationEmitter>,
    context: AdvisorContext,
    started: Instant,
    chunks: usize,
    model: Option<String>,
    usage: Option<Usage>,
    finished: bool,
}

impl ObservedStream {
    fn track(&mut self, chunk: &CompletionChunk) {
        self.chunks += 1;
        if let Some(model) = &chunk.model {
            self.model = Some(model.clone());
        }
        if let Some(usage) = &chunk.usage {
            self.usage = Some(usage.clone());
        }
    }

    fn finish(&mut self, outcome: Outcome, error_category: Option<ErrorCategory>) {
        if self.finished {
            return;
        }
        self.finished = true;
        let observation = Observation {
            error_category,
            model: self.model.take(),
            usage: self.usage.take(),
            chunks: Some(self.chunks),
            ..Observation::finished(&self.context, ObservationMode::Stream, outcome, self.started.elapsed())
        };
        emit_guarded(self.emitter.as_ref(), &observation);
    }
}

impl Stream for ObservedStream {
    type Item = GatewayResult<CompletionChunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        let polled = this.inner.poll_next_unpin(cx);
        match &polled {
            Poll::Ready(Some(Ok(chunk))) => this.track(chunk),
            Poll::Ready(Some(Err(e))) => this.finish(Outcome::Error, Some(e.category())),
            Poll::Ready(None) => this.finish(Outcome::Success, None),
            Poll::Pending => {}
        }
        polled
    }
}

impl Drop for ObservedStream {
    fn drop(&mut self) {
        self.finish(Outcome::Cancelled, Some(ErrorCategory::Cancelled));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisors::chain::AdvisorChain;
    use crate::models::message::Message;
    use crate::providers::base::Prompt;
    use crate::providers::mock::MockInvoker;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collecting(Mutex<Vec<Observation>>);

    impl ObservationEmitter for Collecting {
        fn emit(&self, observation: &Observation) -> GatewayResult<()> {
            self.0.lock().unwrap().push(observation.clone());
            Ok(())
        }
    }

    impl Collecting {
        fn taken(&self) -> Vec<Observation> {
            self.0.lock().unwrap().clone()
        }
    }

    struct Broken;

    impl ObservationEmitter for Broken {
        fn emit(&self, _observation: &Observation) -> GatewayResult<()> {
            Err(GatewayError::Observation("sink unavailable".to_string()))
        }
    }

    struct Panicking;

    impl ObservationEmitter for Panicking {
        fn emit(&self, _observation: &Observation) -> GatewayResult<()> {
            panic!("emitter bug")
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::new(
            AdvisorContext::new("c"),
            Prompt::new("", vec![Message::user("hi")]),
        )
    }

    fn chain(mock: MockInvoker, emitter: Arc<dyn ObservationEmitter>) -> AdvisorChain {
        AdvisorChain::builder(Arc::new(mock))
            .advisor(ObservationAdvisor::new(emitter), ObservationAdvisor::DEFAULT_ORDER)
            .build()
    }

    fn streaming_mock() -> MockInvoker {
        MockInvoker::default().with_stream(vec![
            Ok(CompletionChunk::text("a")),
            Ok(CompletionChunk {
                text: "b".to_string(),
                usage: Some(Usage::new(Some(2), Some(2), Some(4))),
                model: Some("m".to_string()),
            }),
        ])
    }

    #[tokio::test]
    async fn test_call_emits_single_event() -> anyhow::Result<()> {
        let collecting = Arc::new(Collecting::default());
        let req = request();
        let request_id = req.context.request_id();
        chain(MockInvoker::replying(["ok"]), collecting.clone()).call(req).await?;

        let events = collecting.taken();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].request_id, request_id);
        assert_eq!(events[0].outcome, Some(Outcome::Success));
        assert_eq!(events[0].model.as_deref(), Some("mock"));
        assert_eq!(events[0].usage.as_ref().and_then(|u| u.total_tokens), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn test_call_error_is_categorised() {
        let collecting = Arc::new(Collecting::default());
        let mock = MockInvoker::new(vec![Err(GatewayError::FatalUpstream("x".to_string()))]);
        assert!(chain(mock, collecting.clone()).call(request()).await.is_err());

        let events = collecting.taken();
        assert_eq!(events[0].outcome, Some(Outcome::Error));
        assert_eq!(events[0].error_category, Some(ErrorCategory::FatalUpstream));
    }

    #[tokio::test]
    async fn test_stream_emits_start_and_one_terminal_event() -> anyhow::Result<()> {
        let collecting = Arc::new(Collecting::default());
        let chunks: Vec<_> = chain(streaming_mock(), collecting.clone())
            .stream(request())
            .await?
            .collect()
            .await;
        assert_eq!(chunks.len(), 2);

        let events = collecting.taken();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].phase, ObservationPhase::Started);
        assert_eq!(events[1].phase, ObservationPhase::Finished);
        assert_eq!(events[1].outcome, Some(Outcome::Success));
        assert_eq!(events[1].chunks, Some(2));
        assert_eq!(events[1].model.as_deref(), Some("m"));
        assert_eq!(events[1].usage.as_ref().and_then(|u| u.total_tokens), Some(4));
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_stream_reports_cancelled() -> anyhow::Result<()> {
        let collecting = Arc::new(Collecting::default());
        let mut stream = chain(streaming_mock(), collecting.clone())
            .stream(request())
            .await?;
        assert!(stream.next().await.is_some());
        drop(stream);

        let events = collecting.taken();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].outcome, Some(Outcome::Cancelled));
        assert_eq!(events[1].chunks, Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_error_reported_once() -> anyhow::Result<()> {
        let collecting = Arc::new(Collecting::default());
        let mock = MockInvoker::default().with_stream(vec![
            Ok(CompletionChunk::text("a")),
            Err(GatewayError::connection("reset")),
        ]);
        let chunks: Vec<_> = chain(mock, collecting.clone())
            .stream(request())
            .await?
            .collect()
            .await;
        assert!(chunks[1].is_err());

        let events = collecting.taken();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].outcome, Some(Outcome::Error));
        assert_eq!(events[1].error_category, Some(ErrorCategory::TransientUpstream));
        Ok(())
    }

    #[tokio::test]
    async fn test_emitter_failures_never_fail_the_request() -> anyhow::Result<()> {
        let completion = chain(MockInvoker::replying(["fine"]), Arc::new(Broken))
            .call(request())
            .await?;
        assert_eq!(completion.text, "fine");

        let completion = chain(MockInvoker::replying(["still fine"]), Arc::new(Panicking))
            .call(request())
            .await?;
        assert_eq!(completion.text, "still fine");
        Ok(())
    }

    #[test]
    fn test_observation_serializes_duration_in_millis() {
        let context = AdvisorContext::new("c");
        let observation = Observation::finished(
            &context,
            ObservationMode::Call,
            Outcome::Success,
            Duration::from_millis(1500),
        );
        let value = serde_json::to_value(&observation).unwrap();
        assert_eq!(value["duration"], 1500);
        assert_eq!(value["mode"], "call");
        assert_eq!(value["outcome"], "success");
    }
}
