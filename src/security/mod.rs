//! Request-abuse protection for the gateway.

pub mod rate_limiter;

pub use rate_limiter::{RateLimitDecision, SharedRateLimiter};
