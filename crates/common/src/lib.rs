//! Reusable utilities shared by every anchor-watch service: tracing initialization, the retry and
//! backoff policy, the process-wide metrics handles and the ordered shutdown coordinator.

pub mod logging;
pub mod metrics;
pub mod retry;
pub mod shutdown;

// Re-export tracing crate for convenience.
pub use tracing;
