//! anchor-watch follows a bitcoin node, reports the side-chain checkpoints it finds, relays
//! pending anchor transactions and watches protected staking outputs for unauthorized spends.

use std::{fs, path::Path, sync::Arc};

use anchor_watch_common::{
    logging::{self, LoggerConfig},
    metrics::Metrics,
    shutdown::ShutdownCoordinator,
};
use anchor_watch_relayer::Relayer;
use anchor_watch_reporter::Reporter;
use anchor_watch_sidechain::SideChainClient;
use anchor_watch_slasher::Slasher;
use anyhow::Context;
use args::OperationMode;
use btc_follower::{client::BtcClient, rpc::BitcoinRpcClient};
use clap::Parser;
use config::Config;
use constants::{DEFAULT_THREAD_COUNT, DEFAULT_THREAD_STACK_SIZE, METRICS_PREFIX};
use evidence::SideChainSink;
use rpc_server::AnchorWatchRpc;
use serde::de::DeserializeOwned;
use tokio::runtime;
use tracing::{debug, info, trace};

mod args;
mod config;
mod evidence;
mod metrics_server;
mod rpc_server;

mod constants;

fn main() -> anyhow::Result<()> {
    logging::init(LoggerConfig::from_env("anchor-watch"));

    let cli = args::Cli::parse();
    info!(mode = %cli.mode, "starting anchor-watch");

    let config = parse_toml::<Config>(&cli.config)?;
    config.validate().context("invalid configuration")?;

    let runtime = runtime::Builder::new_multi_thread()
        .worker_threads(config.num_threads.unwrap_or(DEFAULT_THREAD_COUNT).into())
        .thread_stack_size(
            config
                .thread_stack_size
                .unwrap_or(DEFAULT_THREAD_STACK_SIZE),
        )
        .enable_all()
        .build()
        .context("create runtime")?;

    runtime.block_on(run(cli.mode, config))?;

    info!("anchor-watch shutdown complete");
    Ok(())
}

/// Wires the components selected by `mode`, then runs until a shutdown signal arrives.
///
/// Failing to reach the bitcoin node or to bind a listener is fatal.
async fn run(mode: OperationMode, config: Config) -> anyhow::Result<()> {
    let (registry, metrics) = Metrics::new(METRICS_PREFIX);

    let btc_config = config.btc_client_config();
    let (user, pass) = btc_config.rpc_auth();
    let rpc = BitcoinRpcClient::new(
        btc_config.rpc_url(),
        user,
        pass,
        btc_config.request_timeout(),
    )
    .context("build bitcoin rpc client")?;
    let btc = BtcClient::connect(rpc, btc_config, metrics.btc.clone())
        .await
        .context("connect to bitcoin node")?;

    let sidechain = SideChainClient::new(&config.sidechain.url, config.sidechain.request_timeout)
        .context("build side-chain client")?;
    info!(url = %sidechain.url(), "side-chain client ready");

    let reporter = mode.runs_reporter().then(|| {
        Reporter::new(
            config.reporter_config(),
            sidechain.clone(),
            metrics.reporter.clone(),
        )
    });
    let slasher = mode.runs_slasher().then(|| {
        Slasher::new(
            btc.clone(),
            SideChainSink::new(sidechain.clone()),
            config.slasher.clone(),
            metrics.slasher.clone(),
        )
    });
    let relayer = mode
        .runs_relayer()
        .then(|| Relayer::new(btc.clone(), config.retry, metrics.relayer.clone()));

    let rpc_impl = AnchorWatchRpc::new(
        btc.watch_connection_status(),
        reporter.as_ref().map(Reporter::handle),
        slasher.as_ref().map(Slasher::handle),
    );
    let rpc_handle = rpc_server::start_rpc(&rpc_impl, &config.rpc_addr).await?;
    let metrics_listener = metrics_server::bind(&config.metrics_addr).await?;

    // Registered producers first: shutdown runs in reverse, so the bitcoin client goes last.
    let mut coordinator = ShutdownCoordinator::new(config.shutdown_timeout);

    let client = btc.clone();
    coordinator.register_cleanup("btc-client", async move {
        client.stop();
        client.wait_for_shutdown().await;
    });

    let registry = Arc::new(registry);
    coordinator.spawn("metrics", move |cancel| {
        metrics_server::serve(metrics_listener, registry, cancel)
    });

    if let Some(reporter) = reporter {
        let blocks = btc.subscribe_blocks().await;
        let ingest = reporter.clone();
        let client = btc.clone();

        coordinator.spawn("reporter-ingest", move |cancel| {
            ingest.run_ingest(client, blocks, cancel)
        });
        coordinator.spawn("reporter-submitter", move |cancel| {
            reporter.run_submitter(cancel)
        });
    }

    if let Some(slasher) = slasher {
        coordinator.spawn("slasher", move |cancel| slasher.run(cancel));
    }

    if let Some(relayer) = relayer {
        let poll_interval = config.relayer.poll_interval;
        let anchors = sidechain.clone();

        coordinator.spawn("relayer", move |cancel| {
            relayer.run_anchors(anchors, poll_interval, cancel)
        });
    }

    coordinator.spawn("rpc", move |cancel| {
        rpc_server::run_until_cancelled(rpc_handle, cancel)
    });

    // subscriptions are in place, start delivering blocks
    btc.start();
    debug!(services = coordinator.len(), "anchor-watch running");

    coordinator.wait_for_signal().await;
    coordinator.shutdown().await.context("shutdown")?;

    Ok(())
}

/// Reads and parses a TOML file from the given path into the given type `T`.
fn parse_toml<T>(path: impl AsRef<Path>) -> anyhow::Result<T>
where
    T: std::fmt::Debug + DeserializeOwned,
{
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read TOML file {}", path.display()))?;
    trace!(?raw, "read file");

    let parsed = toml::from_str::<T>(&raw)
        .with_context(|| format!("failed to parse TOML file {}", path.display()))?;
    debug!(?parsed, "parsed TOML file");

    Ok(parsed)
}
