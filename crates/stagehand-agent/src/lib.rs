//! # stagehand-agent
//!
//! Anthropic Messages API client used as the quality gate's critic.
//!
//! - Stateless requests: every critique is a fresh single-turn call
//! - Rate limit (429) and server error (5xx) retries with backoff
//! - Circuit breaker so a dead API fails fast instead of stalling every stage

mod auth;
mod circuit_breaker;
mod client;
mod types;

pub use auth::resolve_api_key;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use client::{AnthropicCritic, RetryPolicy};
pub use types::*;
