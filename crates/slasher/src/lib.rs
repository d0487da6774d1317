//! Watches protected staking outputs and produces slashing evidence when one of them is spent
//! outside its authorized path.

pub mod config;
pub mod errors;
pub mod handle;
pub mod sink;
pub mod slasher;
pub mod spendable;
pub mod state;

pub use config::{MempoolSpendPolicy, SlasherConfig};
pub use errors::SlasherError;
pub use handle::{SlasherHandle, SlasherStatus};
pub use sink::EvidenceSink;
pub use slasher::Slasher;
pub use spendable::is_output_spendable;
