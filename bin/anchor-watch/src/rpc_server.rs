//! Bootstraps the control RPC server.

use std::fmt;

use anchor_watch_primitives::staking::ProtectedOutput;
use anchor_watch_reporter::{ReporterError, ReporterHandle};
use anchor_watch_rpc::{
    traits::{AnchorWatchControlApiServer, AnchorWatchMonitoringApiServer},
    types::{RpcConnectionStatus, RpcProtectedOutput, RpcReporterStatus, RpcSlasherStatus},
};
use anchor_watch_slasher::{SlasherError, SlasherHandle};
use anyhow::Context;
use async_trait::async_trait;
use btc_follower::event::ConnectionStatus;
use chrono::{DateTime, Utc};
use jsonrpsee::{
    core::RpcResult,
    server::ServerHandle,
    types::{ErrorCode, ErrorObjectOwned},
    RpcModule,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Starts the control RPC server at `rpc_addr`.
pub(crate) async fn start_rpc<T>(rpc_impl: &T, rpc_addr: &str) -> anyhow::Result<ServerHandle>
where
    T: AnchorWatchControlApiServer + AnchorWatchMonitoringApiServer + Clone + Sync + Send,
{
    let mut rpc_module = RpcModule::new(rpc_impl.clone());

    let control_api = AnchorWatchControlApiServer::into_rpc(rpc_impl.clone());
    let monitoring_api = AnchorWatchMonitoringApiServer::into_rpc(rpc_impl.clone());

    rpc_module.merge(control_api).context("merge control api")?;
    rpc_module
        .merge(monitoring_api)
        .context("merge monitoring api")?;

    info!("starting rpc server at {rpc_addr}");
    let rpc_server = jsonrpsee::server::ServerBuilder::new()
        .build(rpc_addr)
        .await
        .with_context(|| format!("bind rpc server to {rpc_addr}"))?;

    let handle = rpc_server.start(rpc_module);
    debug!("rpc server started");

    Ok(handle)
}

/// Keeps the server running until `cancel` fires.
pub(crate) async fn run_until_cancelled(handle: ServerHandle, cancel: CancellationToken) {
    cancel.cancelled().await;
    info!("stopping rpc server");

    if handle.stop().is_err() {
        warn!("rpc server already stopped");
    }
    handle.stopped().await;
}

/// RPC server of the watcher.
///
/// Components that are not running in the selected mode are absent; their methods return an
/// error.
#[derive(Clone)]
pub(crate) struct AnchorWatchRpc {
    /// Process start time.
    start_time: DateTime<Utc>,

    /// Connection status of the bitcoin client.
    connection: watch::Receiver<ConnectionStatus>,

    reporter: Option<ReporterHandle>,

    slasher: Option<SlasherHandle>,
}

impl fmt::Debug for AnchorWatchRpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnchorWatchRpc")
            .field("start_time", &self.start_time)
            .field("reporter", &self.reporter.is_some())
            .field("slasher", &self.slasher.is_some())
            .finish()
    }
}

impl AnchorWatchRpc {
    pub(crate) fn new(
        connection: watch::Receiver<ConnectionStatus>,
        reporter: Option<ReporterHandle>,
        slasher: Option<SlasherHandle>,
    ) -> Self {
        Self {
            start_time: Utc::now(),
            connection,
            reporter,
            slasher,
        }
    }

    fn reporter(&self) -> RpcResult<&ReporterHandle> {
        self.reporter
            .as_ref()
            .ok_or_else(|| not_running("reporter"))
    }

    fn slasher(&self) -> RpcResult<&SlasherHandle> {
        self.slasher.as_ref().ok_or_else(|| not_running("slasher"))
    }

    fn connection_status(&self) -> RpcConnectionStatus {
        match self.connection.borrow().clone() {
            ConnectionStatus::Connecting => RpcConnectionStatus::Connecting,
            ConnectionStatus::Connected => RpcConnectionStatus::Connected,
            ConnectionStatus::Reconnecting { attempts, retry_in } => {
                RpcConnectionStatus::Reconnecting { attempts, retry_in }
            }
            ConnectionStatus::Stopped => RpcConnectionStatus::Stopped,
        }
    }
}

#[async_trait]
impl AnchorWatchControlApiServer for AnchorWatchRpc {
    async fn get_uptime(&self) -> RpcResult<u64> {
        let current_time = Utc::now().timestamp();
        let start_time = self.start_time.timestamp();

        // The user might care about their system time being incorrect.
        if current_time < start_time {
            return Err(rpc_error(
                ErrorCode::InternalError,
                "system time may be inaccurate",
                current_time.saturating_sub(start_time),
            ));
        }

        Ok(current_time.abs_diff(start_time))
    }

    async fn get_connection_status(&self) -> RpcResult<RpcConnectionStatus> {
        Ok(self.connection_status())
    }
}

#[async_trait]
impl AnchorWatchMonitoringApiServer for AnchorWatchRpc {
    async fn get_reporter_status(&self) -> RpcResult<RpcReporterStatus> {
        let status = self.reporter()?.status();

        Ok(RpcReporterStatus {
            last_processed_height: status.last_processed.map(|block| block.height),
            pending_checkpoints: status.pending_checkpoints,
            incomplete_checkpoints: status.incomplete_checkpoints,
            acknowledged_checkpoints: status.acknowledged_checkpoints,
            rejected_checkpoints: status.rejected_checkpoints,
            connection: self.connection_status(),
        })
    }

    async fn get_slasher_status(&self) -> RpcResult<RpcSlasherStatus> {
        let status = self.slasher()?.status();

        Ok(RpcSlasherStatus {
            tracked: status.tracked,
            terminal: status.terminal,
            withdrawn: status.withdrawn,
            pending_evidence: status.pending_evidence,
        })
    }

    async fn rescan(&self, from: u64, to: u64) -> RpcResult<()> {
        self.reporter()?.request_rescan(from, to).map_err(|e| {
            let code = match e {
                ReporterError::InvalidRange { .. } | ReporterError::RangeTooLarge { .. } => {
                    ErrorCode::InvalidParams
                }
                _ => ErrorCode::InternalError,
            };
            rpc_error(code, &e.to_string(), format!("{from}..={to}"))
        })
    }

    async fn register_protected_output(&self, output: RpcProtectedOutput) -> RpcResult<()> {
        let slasher = self.slasher()?;
        let vout = output.vout;

        let protected = ProtectedOutput::from_staking_tx(
            output.staking_tx,
            output.vout,
            output.kind,
            output.authorized,
        )
        .map_err(|e| rpc_error(ErrorCode::InvalidParams, &e.to_string(), vout))?;
        let outpoint = protected.outpoint;

        slasher.register(protected).map_err(|e| {
            let code = match e {
                SlasherError::AlreadyRegistered(_) | SlasherError::Finished(_) => {
                    ErrorCode::InvalidRequest
                }
                _ => ErrorCode::InvalidParams,
            };
            rpc_error(code, &e.to_string(), outpoint)
        })
    }
}

fn not_running(component: &str) -> ErrorObjectOwned {
    rpc_error(
        ErrorCode::InvalidRequest,
        &format!("{component} is not running in this mode"),
        component,
    )
}

/// Returns an [`ErrorObjectOwned`] with the given code, message, and data.
/// Useful for creating custom error objects in RPC responses.
fn rpc_error<T: fmt::Display + Serialize>(
    err_code: ErrorCode,
    message: &str,
    data: T,
) -> ErrorObjectOwned {
    ErrorObjectOwned::owned::<_>(err_code.code(), message, Some(data))
}
