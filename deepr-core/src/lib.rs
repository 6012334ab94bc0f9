//! Deepr Core - shared infrastructure and provider contracts
//!
//! Error taxonomy, configuration, logging, async helpers, and the traits that
//! concrete model and search backends implement.

pub mod async_utils;
pub mod config;
pub mod error;
pub mod logging;
pub mod traits;
pub mod types;

pub use async_utils::*;
pub use config::*;
pub use error::*;
pub use logging::*;
pub use traits::*;
pub use types::*;

// Re-export commonly used external types
pub use async_trait::async_trait;
