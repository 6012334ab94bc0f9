//! Session Management Module
//!
//! The control surface consumed by API/UI layers and the persistence of
//! session records and loop records.

pub mod manager;
pub mod storage;
pub mod types;

pub use manager::SessionManager;
pub use storage::{FileSessionStore, SessionStore};
pub use types::*;
