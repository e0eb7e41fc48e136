pub mod advisors;
pub mod configuration;
pub mod errors;
pub mod memory;
pub mod models;
pub mod orchestrator;
pub mod prompt;
pub mod providers;
pub mod structured;
pub mod telemetry;
pub mod tools;
pub mod utils;
