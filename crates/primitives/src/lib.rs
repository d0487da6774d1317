//! This crate contains general types and pure functions that need to be shared across multiple
//! crates: checkpoint fragments and their wire format, references to base-chain blocks, and the
//! protected outputs watched for slashable spends.
//!
//! It lies at the bottom of the crate-hierarchy in this workspace i.e., it does not depend on any
//! other crate in this workspace.

pub mod block;
pub mod checkpoint;
pub mod staking;
