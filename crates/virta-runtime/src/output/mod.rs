//! Output side of a compiled query: rate limiting and delivery callbacks.

pub mod callback;
pub mod rate_limit;

pub use callback::{build_callback, OutputCallback, OutputError};
pub use rate_limit::{build_rate_limiter, LimiterPhase, OutputRateLimiter, RatePolicy};
