//! Authoritative entity payloads and assignment descriptors.
//!
//! Exactly one state owner holds the live copy of a `PlayerState` or
//! `ChunkState` at any time; everyone else only ever sees snapshots that
//! were carried inside a message.

use crate::ids::{ChunkPos, Generation, PlayerId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

pub const STARTING_TELEPORTS: u32 = 5;
pub const STARTING_BLOCKS: u32 = 5;

/// Per-player item counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub teleports: u32,
    pub blocks: u32,
}

impl Default for Inventory {
    fn default() -> Self {
        Self {
            teleports: STARTING_TELEPORTS,
            blocks: STARTING_BLOCKS,
        }
    }
}

impl fmt::Display for Inventory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tel {} blk {}", self.teleports, self.blocks)
    }
}

/// The authoritative per-player payload owned by the player's validator.
///
/// `PartialEq` matters here: the unlock step of the handoff protocol
/// compares the returned snapshot against the one that was sent out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    /// The chunk the player currently inhabits, if any.
    pub chunk: Option<ChunkInfo>,
    pub inventory: Inventory,
}

impl PlayerState {
    pub fn is_connected(&self) -> bool {
        self.chunk.is_some()
    }
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.chunk {
            Some(info) => write!(f, "{} {}", info.pos, self.inventory),
            None => write!(f, "[not connected] {}", self.inventory),
        }
    }
}

/// Immutable descriptor of one player assignment at one generation.
/// Replaced wholesale (with a bumped generation) on every reassignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: PlayerId,
    pub name: String,
    /// Where the player's agent connected from. Informational; the agent
    /// always dials its validator, never the other way around.
    pub agent_addr: SocketAddr,
    /// Listen address of the validator node owning the player's state.
    pub validator_addr: SocketAddr,
    pub generation: Generation,
}

impl fmt::Display for PlayerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.generation == 0 {
            write!(f, "player {}", self.name)
        } else {
            write!(f, "player {} (g{})", self.name, self.generation)
        }
    }
}

/// Descriptor of one chunk assignment at one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub pos: ChunkPos,
    /// Listen address of the validator node owning the chunk.
    pub validator_addr: SocketAddr,
    pub generation: Generation,
    /// Whether spawn requests may land players in this chunk.
    pub has_spawn: bool,
}

impl fmt::Display for ChunkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.generation == 0 {
            write!(f, "chunk {}", self.pos)
        } else {
            write!(f, "chunk {} (g{})", self.pos, self.generation)
        }
    }
}

/// The chunk payload carried across reassignments: who is present and how
/// much loot is left on the ground.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkState {
    pub players: Vec<PlayerId>,
    pub loot_teleports: u32,
    pub loot_blocks: u32,
}

impl ChunkState {
    /// Initial loot derived deterministically from the assignment seed.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            players: Vec::new(),
            loot_teleports: 4 + (seed % 9) as u32,
            loot_blocks: 4 + ((seed >> 8) % 9) as u32,
        }
    }
}

/// Everything a validator needs to start owning a chunk: a fresh seed at
/// generation 0, or the carried-forward snapshot on reassignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkInit {
    pub info: ChunkInfo,
    pub seed: u64,
    pub state: Option<ChunkState>,
}

impl ChunkInit {
    pub fn state_or_seeded(&self) -> ChunkState {
        self.state
            .clone()
            .unwrap_or_else(|| ChunkState::from_seed(self.seed))
    }
}
