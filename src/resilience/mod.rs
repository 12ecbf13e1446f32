//! Resilience primitives for exchange-facing paths.
//!
//! - Circuit breaker that suspends new position opens after repeated
//!   transient venue failures (closes are never suspended).
//! - Client-side token-bucket rate limiter kept under the venue's
//!   published limits.

mod circuit_breaker;
mod rate_limit;

pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use rate_limit::GatewayRateLimiter;
