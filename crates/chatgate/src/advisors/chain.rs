use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use super::context::ChatRequest;
use crate::errors::{GatewayError, GatewayResult};
use crate::providers::base::{ChunkStream, Completion, ModelInvoker};

/// A cross-cutting interceptor around one model exchange.
///
/// An advisor forwards the request by calling `next`; returning without doing so
/// short-circuits everything further in. Calling `next` again (as retry does) re-runs
/// only the links after this one.
#[async_trait]
pub trait Advisor: Send + Sync {
    fn name(&self) -> &str;

    async fn advise_call(&self, request: ChatRequest, next: CallChain) -> GatewayResult<Completion>;

    async fn advise_stream(
        &self,
        request: ChatRequest,
        next: StreamChain,
    ) -> GatewayResult<ChunkStream> {
        next.stream(request).await
    }
}

/// Name and position of a registered advisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvisorDescriptor {
    pub name: String,
    pub order: i32,
}

#[derive(Clone)]
struct Registered {
    advisor: Arc<dyn Advisor>,
    order: i32,
}

/// The remainder of the chain as seen from inside an advisor's blocking path
#[derive(Clone)]
pub struct CallChain {
    advisors: Arc<[Registered]>,
    index: usize,
    terminal: Arc<dyn ModelInvoker>,
}

impl CallChain {
    pub async fn call(&self, request: ChatRequest) -> GatewayResult<Completion> {
        match self.advisors.get(self.index) {
            Some(link) => link.advisor.advise_call(request, self.next()).await,
            None => {
                let timeout = request.prompt.options.timeout;
                match tokio::time::timeout(timeout, self.terminal.invoke(&request.prompt)).await {
                    Ok(result) => result,
                    Err(_) => Err(elapsed(timeout)),
                }
            }
        }
    }

    fn next(&self) -> Self {
        Self {
            advisors: Arc::clone(&self.advisors),
            index: self.index + 1,
            terminal: Arc::clone(&self.terminal),
        }
    }
}

/// The remainder of the chain as seen from inside an advisor's streaming path
#[derive(Clone)]
pub struct StreamChain {
    advisors: Arc<[Registered]>,
    index: usize,
    terminal: Arc<dyn ModelInvoker>,
}

impl StreamChain {
    /// Open the stream. The invocation timeout bounds establishing the stream only;
    /// once chunks flow the consumer's pull rate sets the pace.
    pub async fn stream(&self, request: ChatRequest) -> GatewayResult<ChunkStream> {
        match self.advisors.get(self.index) {
            Some(link) => link.advisor.advise_stream(request, self.next()).await,
            None => {
                let timeout = request.prompt.options.timeout;
                match tokio::time::timeout(timeout, self.terminal.invoke_stream(&request.prompt))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(elapsed(timeout)),
                }
            }
        }
    }

    fn next(&self) -> Self {
        Self {
            advisors: Arc::clone(&self.advisors),
            index: self.index + 1,
            terminal: Arc::clone(&self.terminal),
        }
    }
}

fn elapsed(timeout: std::time::Duration) -> GatewayError {
    GatewayError::timeout(format!(
        "model invocation exceeded {}ms",
        timeout.as_millis()
    ))
}

/// An immutable, ordered pipeline of advisors around a terminal invoker
#[derive(Clone)]
pub struct AdvisorChain {
    advisors: Arc<[Registered]>,
    terminal: Arc<dyn ModelInvoker>,
}

impl AdvisorChain {
    pub fn builder(terminal: Arc<dyn ModelInvoker>) -> AdvisorChainBuilder {
        AdvisorChainBuilder {
            terminal,
            advisors: Vec::new(),
        }
    }

    /// Advisors in execution order
    pub fn descriptors(&self) -> Vec<AdvisorDescriptor> {
        self.advisors
            .iter()
            .map(|link| AdvisorDescriptor {
                name: link.advisor.name().to_string(),
                order: link.order,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.advisors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.advisors.is_empty()
    }

    pub async fn call(&self, request: ChatRequest) -> GatewayResult<Completion> {
        CallChain {
            advisors: Arc::clone(&self.advisors),
            index: 0,
            terminal: Arc::clone(&self.terminal),
        }
        .call(request)
        .await
    }

    pub async fn stream(&self, request: ChatRequest) -> GatewayResult<ChunkStream> {
        StreamChain {
            advisors: Arc::clone(&self.advisors),
            index: 0,
            terminal: Arc::clone(&self.terminal),
        }
        .stream(request)
        .await
    }
}

impl fmt::Debug for AdvisorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdvisorChain")
            .field("advisors", &self.descriptors())
            .finish()
    }
}

pub struct AdvisorChainBuilder {
    terminal: Arc<dyn ModelInvoker>,
    advisors: Vec<Registered>,
}

impl AdvisorChainBuilder {
    pub fn advisor<A: Advisor + 'static>(self, advisor: A, order: i32) -> Self {
        self.shared(Arc::new(advisor), order)
    }

    pub fn shared(mut self, advisor: Arc<dyn Advisor>, order: i32) -> Self {
        self.advisors.push(Registered { advisor, order });
        self
    }

    pub fn build(mut self) -> AdvisorChain {
        // sort_by_key is stable, equal orders keep registration order
        self.advisors.sort_by_key(|link| link.order);
        AdvisorChain {
            advisors: self.advisors.into(),
            terminal: self.terminal,
        }
    }
}
