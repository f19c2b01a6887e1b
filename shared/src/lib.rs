//! Protocol layer shared by the coordinator, validator nodes and agents.
//!
//! Everything that crosses a socket lives here: entity identifiers and
//! state payloads, the tagged message enum, the length-prefixed frame
//! codec, the per-connection outbound channel, and the remote-action
//! correlation primitives that the lock/handoff protocol is built on.

pub mod channel;
pub mod codec;
pub mod error;
pub mod ids;
pub mod messages;
pub mod remote;
pub mod state;

/// Bumped whenever the wire contract changes incompatibly.
pub const PROTOCOL_VERSION: u32 = 1;
