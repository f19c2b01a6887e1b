//! Identifiers for entities, hosted state owners and remote actions.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Monotonic reassignment counter for a single entity. Incremented by the
/// coordinator every time ownership moves to a new validator; never
/// decreases for a given entity.
pub type Generation = u32;

/// Globally unique player identity, fixed for the player's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerId(Uuid);

impl PlayerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Correlation identifier for one remote action. A fresh id is generated
/// per request and echoed back by the responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId(Uuid);

impl ActionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Grid coordinate of a world chunk; doubles as the chunk's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPos {
    pub x: i32,
    pub y: i32,
}

impl ChunkPos {
    pub const ORIGIN: ChunkPos = ChunkPos { x: 0, y: 0 };

    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// The 8 surrounding grid positions, the chunk itself excluded.
    pub fn neighbors(self) -> impl Iterator<Item = ChunkPos> {
        (-1..=1)
            .flat_map(move |dx| (-1..=1).map(move |dy| ChunkPos::new(self.x + dx, self.y + dy)))
            .filter(move |p| *p != self)
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Addresses one hosted state owner on a validator node. `Process` names
/// the node itself (join/leave, assignments), the other variants a
/// specific owner hosted there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostId {
    Process,
    Player(PlayerId),
    Chunk(ChunkPos),
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostId::Process => write!(f, "process"),
            HostId::Player(id) => write!(f, "player {}", id),
            HostId::Chunk(pos) => write!(f, "chunk {}", pos),
        }
    }
}

/// Local handle for one live connection. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}
