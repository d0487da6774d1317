use std::time::Duration;

use anchor_watch_common::retry::RetryPolicy;
use anchor_watch_reporter::ReporterConfig;
use anchor_watch_slasher::SlasherConfig;
use anyhow::ensure;
use btc_follower::config::BtcClientConfig;
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_RELAYER_POLL_INTERVAL, DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_SIDECHAIN_TIMEOUT,
};

/// The configuration values that dictate the behavior of the watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Config {
    /// The address the control RPC server listens on.
    pub rpc_addr: String,

    /// The address the Prometheus exporter listens on.
    pub metrics_addr: String,

    /// Time every service gets to stop before it is aborted.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,

    /// Number of runtime worker threads.
    pub num_threads: Option<u8>,

    /// Stack size of the runtime worker threads.
    pub thread_stack_size: Option<usize>,

    /// Number of recent blocks remembered to detect reorgs.
    pub reorg_safety_depth: usize,

    /// Backoff applied by every component when a remote call fails.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// The configuration required to connect to the bitcoin node.
    pub btc_client: BtcConfig,

    /// The configuration required to connect to the side-chain node.
    pub sidechain: SideChainConfig,

    /// Reporter settings.
    #[serde(default)]
    pub reporter: ReporterSection,

    /// Relayer settings.
    #[serde(default)]
    pub relayer: RelayerConfig,

    /// Slasher settings.
    #[serde(default)]
    pub slasher: SlasherConfig,
}

impl Config {
    /// Rejects values the services cannot run with.
    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.reorg_safety_depth >= 1,
            "reorg_safety_depth must be at least 1"
        );
        ensure!(
            !self.retry.retry_sleep_time.is_zero(),
            "retry.retry_sleep_time must be positive"
        );
        ensure!(
            !matches!(self.btc_client.poll_interval, Some(d) if d.is_zero()),
            "btc_client.poll_interval must be positive"
        );
        ensure!(
            !self.relayer.poll_interval.is_zero(),
            "relayer.poll_interval must be positive"
        );
        ensure!(
            !self.slasher.poll_interval.is_zero(),
            "slasher.poll_interval must be positive"
        );

        // after a restart a spend is only found again within the search depth
        let depth = self.btc_client_config().spender_search_depth();
        let required = self.slasher.mempool_policy.required_confirmations();
        ensure!(depth >= 1, "btc_client.spender_search_depth must be at least 1");
        ensure!(
            required as usize <= depth,
            "slasher requires {required} confirmations but only {depth} blocks are searched for spenders, raise btc_client.spender_search_depth"
        );

        Ok(())
    }

    /// Client settings derived from the `btc_client` section and the shared values.
    pub(crate) fn btc_client_config(&self) -> BtcClientConfig {
        let btc = &self.btc_client;
        let mut cfg = BtcClientConfig::new(&btc.url, &btc.user, &btc.pass)
            .with_retry_policy(self.retry)
            .with_reorg_safety_depth(self.reorg_safety_depth);

        if let Some(zmq) = &btc.hashblock_connection_string {
            cfg = cfg.with_hashblock_connection_string(zmq);
        }
        if let Some(interval) = btc.poll_interval {
            cfg = cfg.with_poll_interval(interval);
        }
        if let Some(timeout) = btc.request_timeout {
            cfg = cfg.with_request_timeout(timeout);
        }
        if let Some(depth) = btc.spender_search_depth {
            cfg = cfg.with_spender_search_depth(depth);
        }
        if let Some(height) = btc.start_height {
            cfg = cfg.with_start_height(height);
        }

        cfg
    }

    /// Reporter settings derived from the `reporter` section and the shared values.
    pub(crate) fn reporter_config(&self) -> ReporterConfig {
        let mut cfg = ReporterConfig::new(self.retry, self.reorg_safety_depth);

        if let Some(tag) = &self.reporter.tag {
            cfg = cfg.with_tag(tag.as_str());
        }
        if let Some(range) = self.reporter.max_rescan_range {
            cfg.max_rescan_range = range;
        }

        cfg
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BtcConfig {
    pub url: String,
    pub user: String,
    pub pass: String,
    pub hashblock_connection_string: Option<String>,
    pub poll_interval: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub spender_search_depth: Option<usize>,

    /// First height to scan; scanning starts after the tip when unset.
    pub start_height: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SideChainConfig {
    /// URL of the side-chain JSON-RPC endpoint.
    pub url: String,

    /// Timeout of a single request.
    #[serde(default = "default_sidechain_timeout")]
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ReporterSection {
    /// Tag prefixing checkpoint fragments, `awck` when unset.
    pub tag: Option<String>,

    /// Largest block range a single rescan may cover.
    pub max_rescan_range: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RelayerConfig {
    /// Time between two polls of the side-chain's pending anchors.
    pub poll_interval: Duration,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_RELAYER_POLL_INTERVAL,
        }
    }
}

const fn default_shutdown_timeout() -> Duration {
    DEFAULT_SHUTDOWN_TIMEOUT
}

const fn default_sidechain_timeout() -> Duration {
    DEFAULT_SIDECHAIN_TIMEOUT
}

#[cfg(test)]
mod tests {
    use anchor_watch_slasher::MempoolSpendPolicy;

    use super::*;

    #[test]
    fn test_config_serde_toml() {
        let config = r#"
            rpc_addr = "localhost:5678"
            metrics_addr = "localhost:9615"
            shutdown_timeout = { secs = 10, nanos = 0 }
            num_threads = 2
            reorg_safety_depth = 6

            [retry]
            retry_sleep_time = { secs = 5, nanos = 0 }
            max_retry_sleep_time = { secs = 300, nanos = 0 }

            [btc_client]
            url = "http://localhost:18443"
            user = "user"
            pass = "password"
            hashblock_connection_string = "tcp://127.0.0.1:28332"
            spender_search_depth = 12

            [sidechain]
            url = "http://localhost:8432"

            [reporter]
            tag = "test"

            [relayer]
            poll_interval = { secs = 15, nanos = 0 }

            [slasher]
            poll_interval = { secs = 20, nanos = 0 }
            mempool_policy = { require_confirmations = 1 }
        "#;

        let config = toml::from_str::<Config>(config);
        assert!(
            config.is_ok(),
            "must be able to deserialize config from toml but got: {}",
            config.unwrap_err()
        );

        let config = config.unwrap();
        assert_eq!(config.sidechain.request_timeout, DEFAULT_SIDECHAIN_TIMEOUT);
        assert_eq!(
            config.slasher.mempool_policy,
            MempoolSpendPolicy::RequireConfirmations(1)
        );

        let reporter = config.reporter_config();
        assert_eq!(reporter.tag, "test");
        assert_eq!(reporter.reorg_safety_depth, 6);

        let btc = config.btc_client_config();
        assert_eq!(btc.rpc_url(), "http://localhost:18443");
        assert_eq!(btc.spender_search_depth(), 12);

        assert!(config.validate().is_ok());

        let serialized = toml::to_string(&config).unwrap();
        let deserialized = toml::from_str::<Config>(&serialized).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn optional_sections_default() {
        let config = toml::from_str::<Config>(
            r#"
            rpc_addr = "localhost:5678"
            metrics_addr = "localhost:9615"
            reorg_safety_depth = 6

            [btc_client]
            url = "http://localhost:18443"
            user = "user"
            pass = "password"

            [sidechain]
            url = "http://localhost:8432"
            "#,
        )
        .unwrap();

        assert_eq!(config.shutdown_timeout, DEFAULT_SHUTDOWN_TIMEOUT);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.relayer, RelayerConfig::default());
        assert_eq!(config.slasher, SlasherConfig::default());
        assert_eq!(config.reporter_config().tag, "awck");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let base = toml::from_str::<Config>(
            r#"
            rpc_addr = "localhost:5678"
            metrics_addr = "localhost:9615"
            reorg_safety_depth = 6

            [btc_client]
            url = "http://localhost:18443"
            user = "user"
            pass = "password"

            [sidechain]
            url = "http://localhost:8432"
            "#,
        )
        .unwrap();

        let invalid: Vec<(&str, Box<dyn Fn(&mut Config)>)> = vec![
            ("reorg_safety_depth", Box::new(|c: &mut Config| c.reorg_safety_depth = 0)),
            (
                "retry_sleep_time",
                Box::new(|c: &mut Config| c.retry.retry_sleep_time = Duration::ZERO),
            ),
            (
                "btc_client.poll_interval",
                Box::new(|c: &mut Config| c.btc_client.poll_interval = Some(Duration::ZERO)),
            ),
            (
                "relayer.poll_interval",
                Box::new(|c: &mut Config| c.relayer.poll_interval = Duration::ZERO),
            ),
            (
                "slasher.poll_interval",
                Box::new(|c: &mut Config| c.slasher.poll_interval = Duration::ZERO),
            ),
            (
                "spender_search_depth",
                Box::new(|c: &mut Config| {
                    c.slasher.mempool_policy = MempoolSpendPolicy::RequireConfirmations(10)
                }),
            ),
        ];

        for (field, break_config) in invalid {
            let mut config = base.clone();
            break_config(&mut config);

            let err = config.validate().unwrap_err();
            assert!(
                err.to_string().contains(field),
                "expected an error about {field}, got: {err}"
            );
        }

        let mut deep = base;
        deep.slasher.mempool_policy = MempoolSpendPolicy::RequireConfirmations(10);
        deep.btc_client.spender_search_depth = Some(12);
        assert!(deep.validate().is_ok());
    }
}
