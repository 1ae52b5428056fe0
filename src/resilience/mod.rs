//! Resilience: typed retry with backoff and per-store circuit breakers.

pub mod circuit_breaker;
pub mod retry;
