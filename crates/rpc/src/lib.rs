//! Provides the operator-facing control API of the anchor watcher.
//!
//! The API is split into a control group, for information about the process itself, and a
//! monitoring group covering the reporter and the slasher.

pub mod traits;
pub mod types;
