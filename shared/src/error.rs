//! Error taxonomy for the protocol and transport layers.
//!
//! The split matters operationally: a `ProtocolError` means a logic bug
//! somewhere and is fatal for the offending connection or process path,
//! while a `NetError` is the connection-level failure mode that feeds the
//! disconnect-fallback machinery. Contention is neither; it travels as a
//! regular `ResultCode::Fail` response.

use crate::ids::ActionId;
use thiserror::Error;

/// Violations of the message contract or of caller invariants. Never
/// retried; the connection (or process path) that produced one is torn
/// down so the fallback paths can run.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected message {msg} from {peer} peer")]
    UnexpectedMessage { peer: String, msg: &'static str },

    #[error("no pending action matches {0}")]
    UnknownAction(ActionId),

    #[error("action slot already armed by {0}")]
    SlotOccupied(ActionId),

    #[error("lock round-trip returned unchanged state")]
    UnchangedRoundTrip,

    #[error("finalize requested twice")]
    DoubleFinalize,

    #[error("malformed payload: {0}")]
    BadPayload(#[from] bincode::Error),

    #[error("handshake violation: {0}")]
    Handshake(String),
}

/// Transport-level failures. Recoverable at the connection level: the
/// peer is treated as gone and ownership machinery reacts accordingly.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(u32),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
