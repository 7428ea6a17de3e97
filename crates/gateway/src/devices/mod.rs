//! Device connectivity: session registry, request/response bridge, and the
//! WebSocket endpoint.

pub mod bridge;
pub mod registry;
pub mod ws;
