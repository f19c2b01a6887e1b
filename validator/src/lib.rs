//! # Validator Node Library
//!
//! A validator node owns authoritative entity state on behalf of the
//! coordinator: player validators (one per assigned player) and chunk
//! validators (one per assigned world chunk). The state machines in
//! `player` and `chunk` are pure — they consume typed messages and emit
//! routing instructions — while `node` owns the sockets, the single
//! message-processing loop and the dial cache that executes those
//! instructions.

pub mod chunk;
pub mod node;
pub mod player;
pub mod routing;
