//! Runtime adapters and handlers for sweep worker contexts.
//!
//! This crate owns process integration details (training executable launch,
//! local rendezvous, teardown signals, manifest rendering) and exposes a
//! single runtime module boundary for contract, sharding, workspace and
//! supervision primitives from `sweep_core`.

pub mod adapters;
pub mod config;
pub mod handlers;
pub mod logging;
pub mod runtime;
