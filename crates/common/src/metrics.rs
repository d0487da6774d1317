//! Process-wide metrics handles.
//!
//! Every component receives its own metrics struct at construction time. The structs are cheap to
//! clone: each counter and gauge is a shared atomic, so clones update the same series.

use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics updated by the base-chain client.
#[derive(Debug, Clone, Default)]
pub struct BtcClientMetrics {
    /// Number of reconnect attempts since startup.
    pub reconnect_attempts: Counter,

    /// Set to 1 while the client is not connected.
    pub connection_degraded: Gauge,
}

impl BtcClientMetrics {
    /// Creates the metrics and registers them in `registry`.
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();

        registry.register(
            "reconnect_attempts",
            "Number of attempts to reconnect to the bitcoin node",
            metrics.reconnect_attempts.clone(),
        );
        registry.register(
            "btc_connection_degraded",
            "Whether the bitcoin node connection is currently down",
            metrics.connection_degraded.clone(),
        );

        metrics
    }
}

/// Metrics updated by the reporter.
#[derive(Debug, Clone, Default)]
pub struct ReporterMetrics {
    /// Blocks fed through the checkpoint pipeline.
    pub blocks_processed: Counter,

    /// Submission attempts sent to the side-chain.
    pub checkpoints_submitted: Counter,

    /// Checkpoints acknowledged by the side-chain.
    pub checkpoints_acknowledged: Counter,

    /// Transient submission failures.
    pub checkpoints_failed: Counter,

    /// Checkpoints rejected as malformed.
    pub checkpoints_rejected: Counter,

    /// Blocks replaced by a competing block at the same height.
    pub reorgs_detected: Counter,

    /// Complete checkpoints not yet acknowledged.
    pub pending_checkpoints: Gauge,

    /// Height of the most recently processed block.
    pub last_processed_height: Gauge,
}

impl ReporterMetrics {
    /// Creates the metrics and registers them in `registry`.
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();

        registry.register(
            "blocks_processed",
            "Blocks processed by the reporter",
            metrics.blocks_processed.clone(),
        );
        registry.register(
            "checkpoints_submitted",
            "Checkpoint submissions sent to the side-chain",
            metrics.checkpoints_submitted.clone(),
        );
        registry.register(
            "checkpoints_acknowledged",
            "Checkpoints acknowledged by the side-chain",
            metrics.checkpoints_acknowledged.clone(),
        );
        registry.register(
            "checkpoints_failed",
            "Checkpoint submissions that failed transiently",
            metrics.checkpoints_failed.clone(),
        );
        registry.register(
            "checkpoints_rejected",
            "Checkpoints rejected by the side-chain as malformed",
            metrics.checkpoints_rejected.clone(),
        );
        registry.register(
            "reorgs_detected",
            "Blocks replaced by a reorg",
            metrics.reorgs_detected.clone(),
        );
        registry.register(
            "pending_checkpoints",
            "Complete checkpoints awaiting acknowledgment",
            metrics.pending_checkpoints.clone(),
        );
        registry.register(
            "last_processed_height",
            "Height of the last block processed by the reporter",
            metrics.last_processed_height.clone(),
        );

        metrics
    }
}

/// Metrics updated by the relayer.
#[derive(Debug, Clone, Default)]
pub struct RelayerMetrics {
    /// Successful broadcasts.
    pub broadcasts: Counter,

    /// Failed broadcast attempts, transient or not.
    pub broadcast_failures: Counter,
}

impl RelayerMetrics {
    /// Creates the metrics and registers them in `registry`.
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();

        registry.register(
            "relayer_broadcasts",
            "Transactions broadcast by the relayer",
            metrics.broadcasts.clone(),
        );
        registry.register(
            "relayer_broadcast_failures",
            "Failed broadcast attempts",
            metrics.broadcast_failures.clone(),
        );

        metrics
    }
}

/// Metrics updated by the slasher.
#[derive(Debug, Clone, Default)]
pub struct SlasherMetrics {
    /// Outputs currently under surveillance.
    pub protected_outputs_tracked: Gauge,

    /// Outputs flagged as spent outside the authorized path.
    pub protected_outputs_terminal: Gauge,

    /// Evidence records built.
    pub evidence_produced: Counter,

    /// Evidence records accepted by the sink.
    pub evidence_delivered: Counter,
}

impl SlasherMetrics {
    /// Creates the metrics and registers them in `registry`.
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();

        registry.register(
            "protected_outputs_tracked",
            "Protected outputs under surveillance",
            metrics.protected_outputs_tracked.clone(),
        );
        registry.register(
            "protected_outputs_terminal",
            "Protected outputs spent outside the authorized path",
            metrics.protected_outputs_terminal.clone(),
        );
        registry.register(
            "slashing_evidence_produced",
            "Slashing evidence records produced",
            metrics.evidence_produced.clone(),
        );
        registry.register(
            "slashing_evidence_delivered",
            "Slashing evidence records delivered",
            metrics.evidence_delivered.clone(),
        );

        metrics
    }
}

/// All metrics of the process, registered under a common prefix.
#[derive(Debug, Clone)]
pub struct Metrics {
    /// Base-chain client metrics.
    pub btc: BtcClientMetrics,

    /// Reporter metrics.
    pub reporter: ReporterMetrics,

    /// Relayer metrics.
    pub relayer: RelayerMetrics,

    /// Slasher metrics.
    pub slasher: SlasherMetrics,
}

impl Metrics {
    /// Creates a registry with every metric registered under `prefix`.
    pub fn new(prefix: &str) -> (Registry, Self) {
        let mut registry = Registry::with_prefix(prefix);

        let metrics = Self {
            btc: BtcClientMetrics::register(&mut registry),
            reporter: ReporterMetrics::register(&mut registry),
            relayer: RelayerMetrics::register(&mut registry),
            slasher: SlasherMetrics::register(&mut registry),
        };

        (registry, metrics)
    }
}

/// Renders the registry in the Prometheus text exposition format.
pub fn render(registry: &Registry) -> Result<String, std::fmt::Error> {
    let mut buf = String::new();
    encode(&mut buf, registry)?;
    Ok(buf)
}
