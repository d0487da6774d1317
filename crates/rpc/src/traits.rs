//! Traits for the RPC server.

use jsonrpsee::{core::RpcResult, proc_macros::rpc};

use crate::types::{RpcConnectionStatus, RpcProtectedOutput, RpcReporterStatus, RpcSlasherStatus};

/// RPCs related to information about the process itself.
#[cfg_attr(not(feature = "client"), rpc(server, namespace = "anchorwatch"))]
#[cfg_attr(feature = "client", rpc(server, client, namespace = "anchorwatch"))]
pub trait AnchorWatchControlApi {
    /// Get the uptime for the process in seconds assuming the clock is strictly monotonically
    /// increasing.
    #[method(name = "uptime")]
    async fn get_uptime(&self) -> RpcResult<u64>;

    /// Get the state of the connection to the bitcoin node.
    #[method(name = "connectionStatus")]
    async fn get_connection_status(&self) -> RpcResult<RpcConnectionStatus>;
}

/// RPCs that allow monitoring and steering the checkpoint reporter and the slasher.
#[cfg_attr(not(feature = "client"), rpc(server, namespace = "anchorwatch"))]
#[cfg_attr(feature = "client", rpc(server, client, namespace = "anchorwatch"))]
pub trait AnchorWatchMonitoringApi {
    /// Query the progress of the checkpoint reporter.
    #[method(name = "reporterStatus")]
    async fn get_reporter_status(&self) -> RpcResult<RpcReporterStatus>;

    /// Query the number of protected outputs in each state.
    #[method(name = "slasherStatus")]
    async fn get_slasher_status(&self) -> RpcResult<RpcSlasherStatus>;

    /// Re-fetch the blocks in `from..=to` and feed them through the reporter.
    #[method(name = "rescan")]
    async fn rescan(&self, from: u64, to: u64) -> RpcResult<()>;

    /// Put an output under slashing surveillance.
    #[method(name = "registerProtectedOutput")]
    async fn register_protected_output(&self, output: RpcProtectedOutput) -> RpcResult<()>;
}
