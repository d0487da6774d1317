//! Broadcasts side-chain-signed transactions onto the base chain.

pub mod relayer;

pub use relayer::{RelayError, RelayOutcome, Relayer};
