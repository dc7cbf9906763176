//! Key-value cache with a redis primary backend and an in-process fallback,
//! plus the fixed-window rate limiter and session store built on top of it.

pub mod cache;
pub mod memory;
pub mod pattern;
pub mod rate_limit;
pub mod redis_backend;
pub mod session;

pub use cache::{CacheBackend, CacheReport, CacheStats, KeyValueCache};
pub use pattern::glob_match;
pub use rate_limit::{RateLimitInfo, RateLimitScope, RateLimiter};
pub use session::{Session, SessionStore};
