//! Client of the side-chain node.
//!
//! There is no persistent connection: each call stands alone and is retried by its caller
//! according to the classification in [`client::SideChainError`].

pub mod client;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod traits;
pub mod types;

pub use client::{SideChain, SideChainClient, SideChainError, SideChainResult};
