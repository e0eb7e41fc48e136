//! Request/response interceptors and the chain that composes them around a model invoker.
//!
//! Advisors run in ascending `order`; a lower order sees the request first and the response
//! last. Ties keep registration order.
pub mod chain;
pub mod context;
pub mod logging;
pub mod memory;
pub mod observation;
pub mod retry;

pub use chain::{Advisor, AdvisorChain, AdvisorChainBuilder, AdvisorDescriptor, CallChain, StreamChain};
pub use context::{AdvisorContext, ChatRequest};
pub use logging::{LoggingAdvisor, Verbosity};
pub use memory::MemoryAdvisor;
pub use observation::{
    Observation, ObservationAdvisor, ObservationEmitter, ObservationMode, ObservationPhase,
    Outcome, TracingEmitter,
};
pub use retry::{RetryAdvisor, RetryPolicy};
