//! Gateways over external capabilities
//!
//! The tool gateway dispatches planner actions to search, document and
//! auxiliary tool backends. The language model gateway runs completions under
//! one shared limiter with retry, deadlines and cancellation.

pub mod llm;
pub mod tools;

pub use llm::LlmGateway;
pub use tools::ToolGateway;
