//! # Coordinator Library
//!
//! The coordinator assigns entity ownership across the validator pool
//! and survives validator churn by reassigning from the last reported
//! snapshots. `coordinator` is the pure assignment state machine;
//! `network` owns the listener and the connection bookkeeping around it.

pub mod coordinator;
pub mod network;
