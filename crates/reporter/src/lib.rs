//! Reads side-chain checkpoints off the base chain and reports them to the side-chain.
//!
//! Two workers share a [`state::ReporterState`]: the ingest worker feeds delivered (or
//! rescanned) blocks through fragment extraction and assembly, and the submitter worker sends
//! every complete checkpoint to the side-chain until it is acknowledged or rejected.

pub mod config;
pub mod errors;
pub mod handle;
pub mod reporter;
pub mod state;

pub use config::ReporterConfig;
pub use errors::ReporterError;
pub use handle::{ReporterHandle, ReporterStatus};
pub use reporter::Reporter;
pub use state::SubmissionState;
