//! The wire contract: handshake, roles and the tagged message enum.

use crate::ids::{ActionId, ChunkPos, HostId, PlayerId};
use crate::state::{ChunkInfo, ChunkInit, PlayerInfo, PlayerState};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Outcome tag carried by every remote-action response. `Fail` is the
/// recoverable contention answer (lock already held, owner finalizing);
/// protocol violations never travel this channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    Fail,
}

/// What the dialing side claims to be. Fixed for the connection's
/// lifetime; the accepting node picks its dispatch table from this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeRole {
    /// A player's client session.
    Agent(PlayerId),
    /// The assignment coordinator.
    Server,
    /// A validator node offering to own entity state; `listen` is where
    /// other nodes can reach its hosted owners.
    Validator { listen: SocketAddr },
    /// A hosted player state owner.
    PlayerValidator(PlayerInfo),
    /// A hosted chunk state owner.
    ChunkValidator(ChunkInfo),
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Agent(id) => write!(f, "agent {}", id),
            NodeRole::Server => write!(f, "server"),
            NodeRole::Validator { listen } => write!(f, "validator {}", listen),
            NodeRole::PlayerValidator(info) => write!(f, "{} validator", info),
            NodeRole::ChunkValidator(info) => write!(f, "{} validator", info),
        }
    }
}

/// First frame on every connection, before any business message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u32,
    pub role: NodeRole,
    /// Which hosted owner on the accepting node the connection is for.
    pub target: HostId,
}

impl Hello {
    pub fn new(role: NodeRole, target: HostId) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            role,
            target,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    Teleport,
    Block,
}

/// Every business frame is one `Message`; the enum discriminant is the
/// message-type tag on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // agent -> server
    NewPlayerRequest { player: PlayerId },
    NewChunkRequest { pos: ChunkPos },
    SpawnRequest,

    // server -> agent
    NewPlayerGranted { info: PlayerInfo },

    // server -> validator process
    AssignPlayer {
        action: ActionId,
        info: PlayerInfo,
        state: PlayerState,
    },
    AssignChunk {
        action: ActionId,
        init: ChunkInit,
    },
    /// Envelope routing a message to a specific hosted owner over the
    /// process connection.
    ToHost {
        target: HostId,
        inner: Box<Message>,
    },

    // validator process -> server
    StopValidating,
    PlayerHostDisconnect { info: PlayerInfo, state: PlayerState },
    ChunkHostDisconnect { init: ChunkInit },

    // lock/handoff protocol between state owners
    LockState { action: ActionId },
    UnlockState { action: ActionId, state: PlayerState },

    // local mutation requests served by a player validator
    PickupTeleport,
    PickupBlock,
    PlayerDisconnect,

    // routed to a chunk owner by the server
    NewNeighbor { info: ChunkInfo },
    SpawnPlayer { info: PlayerInfo },

    // agent -> chunk owner
    PickupRequest { kind: ItemKind },

    // player validator -> agent
    PlayerSync { state: PlayerState },

    // remote action completion
    Response {
        action: ActionId,
        result: ResultCode,
        payload: Vec<u8>,
    },
}

impl Message {
    /// Stable name for logs and protocol-violation reports.
    pub fn label(&self) -> &'static str {
        match self {
            Message::NewPlayerRequest { .. } => "NewPlayerRequest",
            Message::NewChunkRequest { .. } => "NewChunkRequest",
            Message::SpawnRequest => "SpawnRequest",
            Message::NewPlayerGranted { .. } => "NewPlayerGranted",
            Message::AssignPlayer { .. } => "AssignPlayer",
            Message::AssignChunk { .. } => "AssignChunk",
            Message::ToHost { .. } => "ToHost",
            Message::StopValidating => "StopValidating",
            Message::PlayerHostDisconnect { .. } => "PlayerHostDisconnect",
            Message::ChunkHostDisconnect { .. } => "ChunkHostDisconnect",
            Message::LockState { .. } => "LockState",
            Message::UnlockState { .. } => "UnlockState",
            Message::PickupTeleport => "PickupTeleport",
            Message::PickupBlock => "PickupBlock",
            Message::PlayerDisconnect => "PlayerDisconnect",
            Message::NewNeighbor { .. } => "NewNeighbor",
            Message::SpawnPlayer { .. } => "SpawnPlayer",
            Message::PickupRequest { .. } => "PickupRequest",
            Message::PlayerSync { .. } => "PlayerSync",
            Message::Response { .. } => "Response",
        }
    }
}

/// Payload of a successful lock response. The owner injects the `unlock`
/// correlation id; the locker must echo it back in `UnlockState` together
/// with the (necessarily modified) state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockGrant {
    pub unlock: ActionId,
    pub state: PlayerState,
}

impl LockGrant {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
