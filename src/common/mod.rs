//! Request guards shared by exchange clients
//!
//! - Circuit breaker that stops hammering a venue that keeps failing
//! - Token bucket rate limiter that keeps request bursts under venue limits

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
