//! Public API surfaces
//!
//! - [`AgentApi`]: programmatic agent and supervisor operations
//! - [`http::router`]: the same operations over HTTP, built with axum

pub mod agent;
pub mod http;

pub use agent::AgentApi;
pub use http::router;
