//! Chunk state owner: roster, loot and the locker side of the player
//! handoff protocol.
//!
//! Landing a player in a chunk means taking the exclusive lock on that
//! player's state at its own validator, writing the new world membership
//! into the granted snapshot, and releasing it. At most one lock is ever
//! in flight per player; the coordinator's spawn routing plus the
//! in-flight guard here enforce that.

use crate::routing::{DialSpec, Outgoing};
use log::{info, warn};
use shared::error::ProtocolError;
use shared::ids::{ActionId, ChunkPos, ConnId, HostId, PlayerId};
use shared::messages::{ItemKind, LockGrant, Message, NodeRole, ResultCode};
use shared::remote::ActionRepository;
use shared::state::{ChunkInit, ChunkState, PlayerInfo};
use std::collections::{HashMap, HashSet};

/// Continuation for one in-flight player lock.
#[derive(Debug)]
struct LockCtx {
    player: PlayerInfo,
}

pub struct ChunkValidator {
    init: ChunkInit,
    state: ChunkState,
    neighbors: HashMap<ChunkPos, shared::state::ChunkInfo>,
    /// Players present in the chunk, with the validator addresses needed
    /// to reach their state owners.
    roster: HashMap<PlayerId, PlayerInfo>,
    locks: ActionRepository<PlayerId, LockCtx>,
    lock_inflight: HashSet<PlayerId>,
    finalizing: bool,
}

impl ChunkValidator {
    pub fn new(init: ChunkInit) -> Self {
        let state = init.state_or_seeded();
        Self {
            init,
            state,
            neighbors: HashMap::new(),
            roster: HashMap::new(),
            locks: ActionRepository::new(),
            lock_inflight: HashSet::new(),
            finalizing: false,
        }
    }

    pub fn info(&self) -> &shared::state::ChunkInfo {
        &self.init.info
    }

    pub fn state(&self) -> &ChunkState {
        &self.state
    }

    pub fn neighbor(&self, pos: ChunkPos) -> Option<&shared::state::ChunkInfo> {
        self.neighbors.get(&pos)
    }

    pub fn has_lock_inflight(&self, player: PlayerId) -> bool {
        self.lock_inflight.contains(&player)
    }

    pub fn handle(
        &mut self,
        from: ConnId,
        peer: &NodeRole,
        msg: Message,
    ) -> Result<Vec<Outgoing>, ProtocolError> {
        match (peer, msg) {
            (NodeRole::Server, Message::SpawnPlayer { info }) => self.on_spawn(info),
            (NodeRole::Server, Message::NewNeighbor { info }) => self.on_new_neighbor(info),
            (
                NodeRole::PlayerValidator(_),
                Message::Response {
                    action,
                    result,
                    payload,
                },
            ) => self.on_lock_response(from, action, result, &payload),
            (NodeRole::PlayerValidator(pinfo), Message::PlayerDisconnect) => {
                Ok(self.on_player_disconnect(pinfo.id))
            }
            (NodeRole::Agent(id), Message::PickupRequest { kind }) => Ok(self.on_pickup(*id, kind)),
            (peer, msg) => Err(ProtocolError::UnexpectedMessage {
                peer: peer.to_string(),
                msg: msg.label(),
            }),
        }
    }

    /// Starts the handoff: lock the player's state at its own validator.
    fn on_spawn(&mut self, player: PlayerInfo) -> Result<Vec<Outgoing>, ProtocolError> {
        if self.finalizing {
            info!("{}: finalizing, ignoring spawn of {}", self.init.info, player);
            return Ok(Vec::new());
        }
        if self.lock_inflight.contains(&player.id) {
            info!(
                "{}: transfer already in flight for {}",
                self.init.info, player
            );
            return Ok(Vec::new());
        }
        if self.roster.contains_key(&player.id) {
            info!("{}: {} is already here", self.init.info, player);
            return Ok(Vec::new());
        }

        let action = ActionId::new();
        self.lock_inflight.insert(player.id);
        let spec = self.player_spec(&player);
        self.locks.insert(action, player.id, LockCtx { player })?;

        Ok(vec![Outgoing::remote(
            spec,
            Message::LockState { action },
        )])
    }

    /// Completion of a lock request: on success, write the new world
    /// membership into the snapshot and release the lock with it.
    fn on_lock_response(
        &mut self,
        from: ConnId,
        action: ActionId,
        result: ResultCode,
        payload: &[u8],
    ) -> Result<Vec<Outgoing>, ProtocolError> {
        let ctx = self.locks.complete(action)?;
        self.lock_inflight.remove(&ctx.player.id);

        if result != ResultCode::Success {
            info!(
                "{}: lock refused for {}, dropping transfer",
                self.init.info, ctx.player
            );
            return Ok(Vec::new());
        }

        let grant = LockGrant::decode(payload)?;
        let mut updated = grant.state.clone();
        updated.chunk = Some(self.init.info);

        if updated == grant.state {
            // Releasing an unchanged state is a violation on our side;
            // failing here closes the connection and lets the owner's
            // disconnect fallback clear the lock.
            warn!(
                "{}: {} was already placed here, aborting handoff",
                self.init.info, ctx.player
            );
            return Err(ProtocolError::UnchangedRoundTrip);
        }

        self.state.players.push(ctx.player.id);
        self.roster.insert(ctx.player.id, ctx.player.clone());
        info!("{}: {} entered", self.init.info, ctx.player);

        Ok(vec![Outgoing::reply(
            from,
            Message::UnlockState {
                action: grant.unlock,
                state: updated,
            },
        )])
    }

    /// Gameplay request surface: hand one item from the chunk's loot to
    /// the player, by way of their state owner.
    fn on_pickup(&mut self, player: PlayerId, kind: ItemKind) -> Vec<Outgoing> {
        if self.finalizing {
            info!("{}: finalizing, ignoring pickup", self.init.info);
            return Vec::new();
        }

        let Some(info) = self.roster.get(&player).cloned() else {
            warn!(
                "{}: pickup from player {} who is not here",
                self.init.info, player
            );
            return Vec::new();
        };

        let (stock, forward) = match kind {
            ItemKind::Teleport => (&mut self.state.loot_teleports, Message::PickupTeleport),
            ItemKind::Block => (&mut self.state.loot_blocks, Message::PickupBlock),
        };

        if *stock == 0 {
            info!("{}: no {:?} loot left", self.init.info, kind);
            return Vec::new();
        }
        *stock -= 1;

        let spec = self.player_spec(&info);
        vec![Outgoing::remote(spec, forward)]
    }

    fn on_player_disconnect(&mut self, player: PlayerId) -> Vec<Outgoing> {
        if self.roster.remove(&player).is_some() {
            self.state.players.retain(|id| *id != player);
            info!("{}: player {} left", self.init.info, player);
        }
        Vec::new()
    }

    /// Bidirectional link created by the coordinator when an adjacent
    /// chunk is committed or reassigned.
    fn on_new_neighbor(
        &mut self,
        info: shared::state::ChunkInfo,
    ) -> Result<Vec<Outgoing>, ProtocolError> {
        match self.neighbors.get(&info.pos) {
            Some(known) if known.generation > info.generation => {
                warn!(
                    "{}: stale neighbor notice for {}, keeping g{}",
                    self.init.info, info, known.generation
                );
            }
            _ => {
                info!("{}: linked neighbor {}", self.init.info, info);
                self.neighbors.insert(info.pos, info);
            }
        }
        Ok(Vec::new())
    }

    /// Relinquishes the chunk: snapshot goes back to the coordinator for
    /// reassignment. Unlike players there is no inbound lock to wait on;
    /// locks we initiated die with their connections.
    pub fn finalize(&mut self) -> Result<Vec<Outgoing>, ProtocolError> {
        if self.finalizing {
            return Err(ProtocolError::DoubleFinalize);
        }
        self.finalizing = true;

        let init = ChunkInit {
            info: self.init.info,
            seed: self.init.seed,
            state: Some(self.state.clone()),
        };
        info!("{}: finalized", self.init.info);
        Ok(vec![Outgoing::server(Message::ChunkHostDisconnect { init })])
    }

    pub fn is_finalized(&self) -> bool {
        self.finalizing
    }

    /// Disconnect fallback: any lock outstanding against the lost player
    /// validator is abandoned so a later spawn can retry.
    pub fn player_peer_lost(&mut self, player: PlayerId) -> Vec<Outgoing> {
        for (action, ctx) in self.locks.fail_target(player) {
            warn!(
                "{}: peer gone, abandoning lock {} on {}",
                self.init.info, action, ctx.player
            );
            self.lock_inflight.remove(&ctx.player.id);
        }
        Vec::new()
    }

    fn player_spec(&self, player: &PlayerInfo) -> DialSpec {
        DialSpec {
            addr: player.validator_addr,
            target: HostId::Player(player.id),
            hello_role: NodeRole::ChunkValidator(self.init.info),
            peer_role: NodeRole::PlayerValidator(player.clone()),
        }
    }
}
