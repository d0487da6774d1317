//! This crate provides test-utilities for generating base-chain data.
//!
//! These utilities are mostly used to generate arbitrary blocks, transactions and outpoints for
//! testing purposes, where building realistic fixtures by hand would drown the test in
//! boilerplate.

pub mod bitcoin;
