//! LLM abstraction for the HomeBase gateway.
//!
//! - [`traits::LlmClient`] — the provider-agnostic chat/stream interface
//! - adapters: [`anthropic`], [`openai_compat`], [`local`]
//! - [`registry::ProviderRegistry`] — instantiates configured providers
//! - [`resilient::ResilientClient`] — per-role fallback chains on retryable
//!   errors, with token accounting
//! - [`selector::ModelSelector`] — role/criteria → concrete model selection

pub mod anthropic;
pub mod local;
pub mod openai_compat;
pub mod registry;
pub mod resilient;
pub mod selector;
mod sse;
pub mod tokens;
pub mod traits;
mod util;

pub use registry::ProviderRegistry;
pub use resilient::{is_retryable_error, CallContext, ResilientClient};
pub use selector::{ModelSelector, Selection};
pub use tokens::{TokenTracker, UsageRow};
pub use traits::{ChatRequest, ChatResponse, LlmClient};
