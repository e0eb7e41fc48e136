//! These models represent the objects passed between the orchestrator, the advisor chain
//! and the model invoker.
//!
//! Inbound requests are converted into these structs immediately; the provider modules
//! translate them into whatever wire format the upstream API expects.
pub mod message;
pub mod role;
pub mod tool;
