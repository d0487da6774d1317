use std::time::Duration;

pub(crate) const DEFAULT_THREAD_COUNT: u8 = 4;

pub(crate) const DEFAULT_THREAD_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Prefix of every exported metric.
pub(crate) const METRICS_PREFIX: &str = "anchor_watch";

pub(crate) const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) const DEFAULT_SIDECHAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) const DEFAULT_RELAYER_POLL_INTERVAL: Duration = Duration::from_secs(30);
