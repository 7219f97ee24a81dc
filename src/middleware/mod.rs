//! Middleware for observability.
//!
//! Request logging with latency tracking. Exchange-side rate limiting
//! lives in `exchange::ratelimit`, not here — this module is purely
//! the HTTP façade's ambient logging layer.

pub mod logging;

pub use logging::{request_logging, request_logging_simple};
