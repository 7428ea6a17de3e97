//! Shared domain types for the HomeBase workspace: errors, configuration,
//! provider-agnostic chat messages, streaming events, model roles, and
//! agent identifiers.

pub mod agent_id;
pub mod config;
pub mod error;
pub mod message;
pub mod role;
pub mod stream;

pub use agent_id::AgentId;
pub use error::{Error, Result};
