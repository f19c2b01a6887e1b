//! Assignment state machine: which validator owns which entity, at which
//! generation.
//!
//! Every assignment is a remote action against the chosen validator.
//! Until the validator acknowledges, the entity is locked (no concurrent
//! assignment) and only carried in the pending repository; acknowledgment
//! commits it to the registry. Reassignment after a host or validator is
//! lost replays the last reported snapshot at a bumped generation, so a
//! stale host coming back late can be told apart and ignored.

use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::error::ProtocolError;
use shared::ids::{ActionId, ChunkPos, ConnId, HostId, PlayerId};
use shared::messages::{Message, ResultCode};
use shared::remote::ActionRepository;
use shared::state::{ChunkInfo, ChunkInit, ChunkState, PlayerInfo, PlayerState};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

const NAME_ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Base62 rendering of the player name counter.
fn encode_name(mut n: u64) -> String {
    let mut digits = Vec::new();
    loop {
        digits.push(NAME_ALPHABET[(n % 62) as usize]);
        n /= 62;
        if n == 0 {
            break;
        }
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

/// A message for the network layer to put on one connection's channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub to: ConnId,
    pub msg: Message,
}

#[derive(Debug, Clone, Copy)]
struct ValidatorEntry {
    conn: ConnId,
    listen: SocketAddr,
}

struct PlayerRecord {
    info: PlayerInfo,
    /// Snapshot from the last host teardown; what a reassignment replays.
    last_state: PlayerState,
}

struct ChunkRecord {
    info: ChunkInfo,
    seed: u64,
    last_state: Option<ChunkState>,
}

/// Continuation for one in-flight or parked assignment.
enum PendingAssign {
    Player {
        info: PlayerInfo,
        state: PlayerState,
        /// Agent connections waiting on `NewPlayerGranted`. Requests that
        /// race an assignment already in flight pile up here; all of them
        /// are answered by the commit. Reassignments carry no requesters.
        requesters: Vec<ConnId>,
    },
    Chunk {
        init: ChunkInit,
    },
}

pub struct Coordinator {
    pool: Vec<ValidatorEntry>,
    validator_conns: HashMap<SocketAddr, ConnId>,
    players: HashMap<PlayerId, PlayerRecord>,
    chunks: HashMap<ChunkPos, ChunkRecord>,
    pending: ActionRepository<ConnId, PendingAssign>,
    /// Assignments that found the pool empty. They keep their generation
    /// and name and are replayed when the next validator joins.
    parked: Vec<PendingAssign>,
    player_locks: HashSet<PlayerId>,
    chunk_locks: HashSet<ChunkPos>,
    rng: StdRng,
    /// Grid period of spawn-capable chunks; 0 restricts spawning to the
    /// origin chunk.
    spawn_density: i32,
    name_counter: u64,
}

impl Coordinator {
    pub fn new(seed: u64, spawn_density: i32) -> Self {
        Self {
            pool: Vec::new(),
            validator_conns: HashMap::new(),
            players: HashMap::new(),
            chunks: HashMap::new(),
            pending: ActionRepository::new(),
            parked: Vec::new(),
            player_locks: HashSet::new(),
            chunk_locks: HashSet::new(),
            rng: StdRng::seed_from_u64(seed),
            spawn_density,
            name_counter: 0,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn player_info(&self, id: PlayerId) -> Option<&PlayerInfo> {
        self.players.get(&id).map(|r| &r.info)
    }

    pub fn chunk_info(&self, pos: ChunkPos) -> Option<&ChunkInfo> {
        self.chunks.get(&pos).map(|r| &r.info)
    }

    pub fn on_validator_join(
        &mut self,
        conn: ConnId,
        listen: SocketAddr,
    ) -> Result<Vec<Outgoing>, ProtocolError> {
        debug_assert!(!self.pool.iter().any(|v| v.conn == conn));
        info!("validator {} joined the pool ({})", listen, conn);
        self.pool.push(ValidatorEntry { conn, listen });
        self.validator_conns.insert(listen, conn);

        // Assignments that were waiting out an empty pool can go now.
        let parked = std::mem::take(&mut self.parked);
        let mut out = Vec::new();
        for ctx in parked {
            match ctx {
                PendingAssign::Player {
                    info,
                    state,
                    requesters,
                } => out.extend(self.assign_player(info, state, requesters)?),
                PendingAssign::Chunk { init } => out.extend(self.assign_chunk(init)?),
            }
        }
        Ok(out)
    }

    /// Graceful leave: the node stops taking assignments but keeps its
    /// hosted owners alive until each finalizes and reports back.
    pub fn on_validator_leave(&mut self, conn: ConnId) {
        let idx = self.pool.iter().position(|v| v.conn == conn);
        debug_assert!(idx.is_some(), "leave from a validator not in the pool");
        if let Some(idx) = idx {
            let entry = self.pool.swap_remove(idx);
            info!("validator {} left the pool", entry.listen);
        }
    }

    /// First contact from an agent. A known player gets its current
    /// descriptor back; an unknown one gets named and assigned.
    pub fn on_new_player_request(
        &mut self,
        requester: ConnId,
        agent_addr: SocketAddr,
        id: PlayerId,
    ) -> Result<Vec<Outgoing>, ProtocolError> {
        if let Some(record) = self.players.get(&id) {
            info!("{} reconnected", record.info);
            return Ok(vec![Outgoing {
                to: requester,
                msg: Message::NewPlayerGranted {
                    info: record.info.clone(),
                },
            }]);
        }
        if self.player_locks.contains(&id) {
            info!("player {} requested while assignment in flight", id);
            self.attach_player_requester(id, requester);
            return Ok(Vec::new());
        }

        let name = encode_name(self.name_counter);
        self.name_counter += 1;
        let info = PlayerInfo {
            id,
            name,
            agent_addr,
            // Placeholder until a validator is picked.
            validator_addr: agent_addr,
            generation: 0,
        };
        self.assign_player(info, PlayerState::default(), vec![requester])
    }

    /// Adds a requester to the assignment the player lock belongs to, be
    /// it in flight or parked, so the eventual commit answers everyone.
    fn attach_player_requester(&mut self, id: PlayerId, requester: ConnId) {
        let matching = |ctx: &&mut PendingAssign| {
            matches!(ctx, PendingAssign::Player { info, .. } if info.id == id)
        };
        let found = self
            .pending
            .iter_mut()
            .map(|(_, ctx)| ctx)
            .find(matching)
            .or_else(|| self.parked.iter_mut().find(|ctx| matching(ctx)));
        match found {
            Some(PendingAssign::Player { requesters, .. }) => requesters.push(requester),
            _ => warn!("player {} locked without a pending assignment", id),
        }
    }

    fn assign_player(
        &mut self,
        mut info: PlayerInfo,
        state: PlayerState,
        requesters: Vec<ConnId>,
    ) -> Result<Vec<Outgoing>, ProtocolError> {
        self.player_locks.insert(info.id);
        let Some(validator) = self.pick_validator() else {
            warn!("validator pool empty, parking assignment of {}", info);
            self.parked.push(PendingAssign::Player {
                info,
                state,
                requesters,
            });
            return Ok(Vec::new());
        };
        info.validator_addr = validator.listen;

        let action = ActionId::new();
        self.pending.insert(
            action,
            validator.conn,
            PendingAssign::Player {
                info: info.clone(),
                state: state.clone(),
                requesters,
            },
        )?;

        info!("assigning {} to {}", info, validator.listen);
        Ok(vec![Outgoing {
            to: validator.conn,
            msg: Message::AssignPlayer {
                action,
                info,
                state,
            },
        }])
    }

    /// Idempotent: a chunk that is committed or mid-assignment stays as
    /// it is.
    pub fn on_new_chunk_request(&mut self, pos: ChunkPos) -> Result<Vec<Outgoing>, ProtocolError> {
        if self.chunks.contains_key(&pos) || self.chunk_locks.contains(&pos) {
            return Ok(Vec::new());
        }

        let info = ChunkInfo {
            pos,
            // Placeholder until a validator is picked.
            validator_addr: ([0, 0, 0, 0], 0).into(),
            generation: 0,
            has_spawn: self.has_spawn(pos),
        };
        let init = ChunkInit {
            info,
            seed: self.rng.gen(),
            state: None,
        };
        self.assign_chunk(init)
    }

    fn has_spawn(&self, pos: ChunkPos) -> bool {
        let d = self.spawn_density;
        if d == 0 {
            pos == ChunkPos::ORIGIN
        } else {
            pos.x % d == 0 && pos.y % d == 0
        }
    }

    fn assign_chunk(&mut self, mut init: ChunkInit) -> Result<Vec<Outgoing>, ProtocolError> {
        self.chunk_locks.insert(init.info.pos);
        let Some(validator) = self.pick_validator() else {
            warn!("validator pool empty, parking assignment of {}", init.info);
            self.parked.push(PendingAssign::Chunk { init });
            return Ok(Vec::new());
        };
        init.info.validator_addr = validator.listen;

        let action = ActionId::new();
        self.pending.insert(
            action,
            validator.conn,
            PendingAssign::Chunk { init: init.clone() },
        )?;

        info!("assigning {} to {}", init.info, validator.listen);
        Ok(vec![Outgoing {
            to: validator.conn,
            msg: Message::AssignChunk { action, init },
        }])
    }

    fn pick_validator(&mut self) -> Option<ValidatorEntry> {
        if self.pool.is_empty() {
            return None;
        }
        let idx = self.rng.gen_range(0..self.pool.len());
        Some(self.pool[idx])
    }

    /// Assignment acknowledgment from a validator. Success commits the
    /// entity; for chunks it also links neighbors in both directions.
    pub fn on_response(
        &mut self,
        action: ActionId,
        result: ResultCode,
    ) -> Result<Vec<Outgoing>, ProtocolError> {
        match self.pending.complete(action)? {
            PendingAssign::Player {
                info,
                state,
                requesters,
            } => {
                self.player_locks.remove(&info.id);
                if result != ResultCode::Success {
                    warn!("assignment of {} refused", info);
                    return Ok(Vec::new());
                }

                info!("{} committed at {}", info, info.validator_addr);
                let mut out = Vec::new();
                for requester in requesters {
                    out.push(Outgoing {
                        to: requester,
                        msg: Message::NewPlayerGranted { info: info.clone() },
                    });
                }
                self.players.insert(
                    info.id,
                    PlayerRecord {
                        info,
                        last_state: state,
                    },
                );
                Ok(out)
            }
            PendingAssign::Chunk { init } => {
                self.chunk_locks.remove(&init.info.pos);
                if result != ResultCode::Success {
                    warn!("assignment of {} refused", init.info);
                    return Ok(Vec::new());
                }

                info!("{} committed at {}", init.info, init.info.validator_addr);
                let out = self.link_neighbors(init.info);
                self.chunks.insert(
                    init.info.pos,
                    ChunkRecord {
                        info: init.info,
                        seed: init.seed,
                        last_state: init.state,
                    },
                );
                Ok(out)
            }
        }
    }

    fn link_neighbors(&self, info: ChunkInfo) -> Vec<Outgoing> {
        let mut out = Vec::new();
        for npos in info.pos.neighbors() {
            let Some(neighbor) = self.chunks.get(&npos) else {
                continue;
            };
            out.extend(self.to_host(
                HostId::Chunk(npos),
                neighbor.info.validator_addr,
                Message::NewNeighbor { info },
            ));
            out.extend(self.to_host(
                HostId::Chunk(info.pos),
                info.validator_addr,
                Message::NewNeighbor {
                    info: neighbor.info,
                },
            ));
        }
        out
    }

    /// Routes a message to a hosted owner through its node's process
    /// connection. Dropped when the node is no longer connected; the
    /// validator-lost path will reassign its owners anyway.
    fn to_host(&self, target: HostId, addr: SocketAddr, msg: Message) -> Option<Outgoing> {
        let Some(conn) = self.validator_conns.get(&addr) else {
            warn!("no connection to validator {}, dropping {}", addr, msg.label());
            return None;
        };
        Some(Outgoing {
            to: *conn,
            msg: Message::ToHost {
                target,
                inner: Box::new(msg),
            },
        })
    }

    /// Lands a player in a random spawn-capable chunk.
    pub fn on_spawn_request(&mut self, id: PlayerId) -> Result<Vec<Outgoing>, ProtocolError> {
        let Some(record) = self.players.get(&id) else {
            warn!("spawn request for unknown player {}", id);
            return Ok(Vec::new());
        };
        let info = record.info.clone();

        let spawns: Vec<ChunkPos> = self
            .chunks
            .values()
            .filter(|r| r.info.has_spawn)
            .map(|r| r.info.pos)
            .collect();
        if spawns.is_empty() {
            warn!("no spawn-capable chunks, dropping spawn of {}", info);
            return Ok(Vec::new());
        }

        let pos = spawns[self.rng.gen_range(0..spawns.len())];
        let addr = self.chunks[&pos].info.validator_addr;
        info!("spawning {} into chunk {}", info, pos);
        Ok(self
            .to_host(HostId::Chunk(pos), addr, Message::SpawnPlayer { info })
            .into_iter()
            .collect())
    }

    /// A player host finalized. Current generation only; a stale host
    /// reporting after its entity was already reassigned is ignored.
    pub fn on_player_host_disconnect(
        &mut self,
        info: PlayerInfo,
        state: PlayerState,
    ) -> Result<Vec<Outgoing>, ProtocolError> {
        match self.players.get(&info.id) {
            Some(record) if record.info.generation == info.generation => {}
            _ => {
                warn!("stale host teardown for {}, ignored", info);
                return Ok(Vec::new());
            }
        }
        self.players.remove(&info.id);

        let mut next = info;
        next.generation += 1;
        self.assign_player(next, state, Vec::new())
    }

    pub fn on_chunk_host_disconnect(
        &mut self,
        init: ChunkInit,
    ) -> Result<Vec<Outgoing>, ProtocolError> {
        match self.chunks.get(&init.info.pos) {
            Some(record) if record.info.generation == init.info.generation => {}
            _ => {
                warn!("stale host teardown for {}, ignored", init.info);
                return Ok(Vec::new());
            }
        }
        self.chunks.remove(&init.info.pos);

        let mut next = init;
        next.info.generation += 1;
        self.assign_chunk(next)
    }

    /// Hard disconnect of a validator node. In-flight assignments retry
    /// at the same generation; committed entities it owned are replayed
    /// from their last snapshots at the next one.
    pub fn on_validator_lost(&mut self, conn: ConnId) -> Result<Vec<Outgoing>, ProtocolError> {
        if let Some(idx) = self.pool.iter().position(|v| v.conn == conn) {
            self.pool.swap_remove(idx);
        }
        // A node that left the pool gracefully is gone from `pool` but
        // still routable until its owners finalize; the connection map is
        // what ties the lost conn back to the listen address its owners
        // are registered under.
        let Some(listen) = self
            .validator_conns
            .iter()
            .find(|(_, c)| **c == conn)
            .map(|(addr, _)| *addr)
        else {
            return Ok(Vec::new());
        };
        self.validator_conns.remove(&listen);
        warn!("validator {} lost, reassigning its owners", listen);

        let mut out = Vec::new();

        for (_, ctx) in self.pending.fail_target(conn) {
            match ctx {
                PendingAssign::Player {
                    info,
                    state,
                    requesters,
                } => {
                    self.player_locks.remove(&info.id);
                    out.extend(self.assign_player(info, state, requesters)?);
                }
                PendingAssign::Chunk { init } => {
                    self.chunk_locks.remove(&init.info.pos);
                    out.extend(self.assign_chunk(init)?);
                }
            }
        }

        let players: Vec<PlayerId> = self
            .players
            .iter()
            .filter(|(_, r)| r.info.validator_addr == listen)
            .map(|(id, _)| *id)
            .collect();
        for id in players {
            let record = match self.players.remove(&id) {
                Some(r) => r,
                None => continue,
            };
            let mut next = record.info;
            next.generation += 1;
            out.extend(self.assign_player(next, record.last_state, Vec::new())?);
        }

        let chunks: Vec<ChunkPos> = self
            .chunks
            .iter()
            .filter(|(_, r)| r.info.validator_addr == listen)
            .map(|(pos, _)| *pos)
            .collect();
        for pos in chunks {
            let record = match self.chunks.remove(&pos) {
                Some(r) => r,
                None => continue,
            };
            let mut info = record.info;
            info.generation += 1;
            out.extend(self.assign_chunk(ChunkInit {
                info,
                seed: record.seed,
                state: record.last_state,
            })?);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn coordinator() -> Coordinator {
        Coordinator::new(7, 2)
    }

    fn joined(c: &mut Coordinator, n: u64) -> Vec<ConnId> {
        (0..n)
            .map(|i| {
                let conn = ConnId(100 + i);
                c.on_validator_join(conn, addr(9000 + i as u16)).unwrap();
                conn
            })
            .collect()
    }

    fn action_of(out: &[Outgoing]) -> ActionId {
        match &out[0].msg {
            Message::AssignPlayer { action, .. } | Message::AssignChunk { action, .. } => *action,
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    /// Runs a player request through to commitment, returning the agent's
    /// grant.
    fn commit_player(c: &mut Coordinator, requester: ConnId, id: PlayerId) -> PlayerInfo {
        let out = c.on_new_player_request(requester, addr(4000), id).unwrap();
        let action = action_of(&out);
        let out = c.on_response(action, ResultCode::Success).unwrap();
        assert_eq!(out[0].to, requester);
        match &out[0].msg {
            Message::NewPlayerGranted { info } => info.clone(),
            other => panic!("expected grant, got {:?}", other),
        }
    }

    fn commit_chunk(c: &mut Coordinator, pos: ChunkPos) -> Vec<Outgoing> {
        let out = c.on_new_chunk_request(pos).unwrap();
        let action = action_of(&out);
        c.on_response(action, ResultCode::Success).unwrap()
    }

    #[test]
    fn test_player_commits_on_ack_and_agent_is_granted() {
        let mut c = coordinator();
        let validators = joined(&mut c, 1);

        let id = PlayerId::new();
        let out = c.on_new_player_request(ConnId(1), addr(4000), id).unwrap();
        assert_eq!(out[0].to, validators[0]);
        assert_eq!(c.player_count(), 0); // not committed yet

        let action = action_of(&out);
        let out = c.on_response(action, ResultCode::Success).unwrap();
        assert_eq!(out[0].to, ConnId(1));
        let info = match &out[0].msg {
            Message::NewPlayerGranted { info } => info.clone(),
            other => panic!("expected grant, got {:?}", other),
        };
        assert_eq!(info.id, id);
        assert_eq!(info.generation, 0);
        assert_eq!(info.validator_addr, addr(9000));
        assert_eq!(c.player_count(), 1);
    }

    #[test]
    fn test_player_names_count_up_in_base62() {
        let mut c = coordinator();
        joined(&mut c, 1);

        let first = commit_player(&mut c, ConnId(1), PlayerId::new());
        let second = commit_player(&mut c, ConnId(2), PlayerId::new());
        assert_eq!(first.name, "0");
        assert_eq!(second.name, "1");
    }

    #[test]
    fn test_encode_name_rolls_over_at_62() {
        assert_eq!(encode_name(0), "0");
        assert_eq!(encode_name(35), "Z");
        assert_eq!(encode_name(61), "z");
        assert_eq!(encode_name(62), "10");
        assert_eq!(encode_name(62 * 62), "100");
    }

    #[test]
    fn test_reconnect_returns_current_descriptor_without_reassigning() {
        let mut c = coordinator();
        joined(&mut c, 1);

        let id = PlayerId::new();
        let info = commit_player(&mut c, ConnId(1), id);

        let out = c.on_new_player_request(ConnId(2), addr(4001), id).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, ConnId(2));
        assert_eq!(
            out[0].msg,
            Message::NewPlayerGranted { info: info.clone() }
        );
        assert_eq!(c.player_count(), 1);
    }

    #[test]
    fn test_refused_assignment_is_not_committed() {
        let mut c = coordinator();
        joined(&mut c, 1);

        let id = PlayerId::new();
        let out = c.on_new_player_request(ConnId(1), addr(4000), id).unwrap();
        let action = action_of(&out);

        let out = c.on_response(action, ResultCode::Fail).unwrap();
        assert!(out.is_empty());
        assert_eq!(c.player_count(), 0);

        // The lock is released: the player can be requested again.
        let out = c.on_new_player_request(ConnId(1), addr(4000), id).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_empty_pool_parks_request_until_a_validator_joins() {
        let mut c = coordinator();
        let id = PlayerId::new();
        let out = c.on_new_player_request(ConnId(1), addr(4000), id).unwrap();
        assert!(out.is_empty());
        assert_eq!(c.player_count(), 0);

        // The join replays the parked assignment and the original
        // requester still gets its grant.
        let out = c.on_validator_join(ConnId(100), addr(9000)).unwrap();
        let action = action_of(&out);
        assert_eq!(out[0].to, ConnId(100));

        let granted = c.on_response(action, ResultCode::Success).unwrap();
        assert_eq!(granted[0].to, ConnId(1));
        assert_eq!(c.player_info(id).unwrap().generation, 0);
    }

    #[test]
    fn test_generation_survives_pool_exhaustion() {
        let mut c = coordinator();
        let lost = joined(&mut c, 1)[0];
        let id = PlayerId::new();
        let info = commit_player(&mut c, ConnId(1), id);

        // Losing the only validator leaves nowhere to reassign to; the
        // record must wait at its bumped generation, not evaporate.
        assert!(c.on_validator_lost(lost).unwrap().is_empty());

        // A re-request during the wait attaches instead of minting a
        // fresh generation-zero player.
        assert!(c
            .on_new_player_request(ConnId(2), addr(4000), id)
            .unwrap()
            .is_empty());

        let out = c.on_validator_join(ConnId(200), addr(9100)).unwrap();
        match &out[0].msg {
            Message::AssignPlayer { info: next, .. } => {
                assert_eq!(next.generation, info.generation + 1);
                assert_eq!(next.name, info.name);
            }
            other => panic!("expected assignment, got {:?}", other),
        }

        let granted = c.on_response(action_of(&out), ResultCode::Success).unwrap();
        assert_eq!(granted[0].to, ConnId(2));
        assert_eq!(c.player_info(id).unwrap().generation, 1);
    }

    #[test]
    fn test_validator_lost_after_leave_still_reassigns_its_owners() {
        let mut c = coordinator();
        let lost = joined(&mut c, 1)[0];
        let id = PlayerId::new();
        commit_player(&mut c, ConnId(1), id);

        // Graceful leave, then the node dies before its owners finalize.
        c.on_validator_leave(lost);
        c.on_validator_join(ConnId(200), addr(9100)).unwrap();

        let out = c.on_validator_lost(lost).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, ConnId(200));
        match &out[0].msg {
            Message::AssignPlayer { info, .. } => assert_eq!(info.generation, 1),
            other => panic!("expected assignment, got {:?}", other),
        }

        c.on_response(action_of(&out), ResultCode::Success).unwrap();
        assert_eq!(c.player_info(id).unwrap().validator_addr, addr(9100));
    }

    #[test]
    fn test_racing_requests_are_all_answered_by_the_commit() {
        let mut c = coordinator();
        joined(&mut c, 1);

        let id = PlayerId::new();
        let out = c.on_new_player_request(ConnId(1), addr(4000), id).unwrap();
        let action = action_of(&out);

        // Second request for the same player while the first assignment
        // is still in flight.
        assert!(c
            .on_new_player_request(ConnId(2), addr(4000), id)
            .unwrap()
            .is_empty());

        let granted = c.on_response(action, ResultCode::Success).unwrap();
        let answered: Vec<ConnId> = granted
            .iter()
            .filter(|o| matches!(o.msg, Message::NewPlayerGranted { .. }))
            .map(|o| o.to)
            .collect();
        assert_eq!(answered, vec![ConnId(1), ConnId(2)]);
        assert_eq!(c.player_count(), 1);
    }

    #[test]
    fn test_chunk_request_is_idempotent() {
        let mut c = coordinator();
        joined(&mut c, 1);

        let out = c.on_new_chunk_request(ChunkPos::ORIGIN).unwrap();
        assert_eq!(out.len(), 1);

        // Again while in flight, and again after commitment.
        assert!(c.on_new_chunk_request(ChunkPos::ORIGIN).unwrap().is_empty());
        c.on_response(action_of(&out), ResultCode::Success).unwrap();
        assert!(c.on_new_chunk_request(ChunkPos::ORIGIN).unwrap().is_empty());
        assert_eq!(c.chunk_count(), 1);
    }

    #[test]
    fn test_spawn_capability_follows_density_grid() {
        let mut c = Coordinator::new(7, 2);
        assert!(c.has_spawn(ChunkPos::new(0, 0)));
        assert!(c.has_spawn(ChunkPos::new(2, -4)));
        assert!(!c.has_spawn(ChunkPos::new(1, 0)));
        assert!(!c.has_spawn(ChunkPos::new(2, 3)));

        // Density zero: origin only.
        c = Coordinator::new(7, 0);
        assert!(c.has_spawn(ChunkPos::ORIGIN));
        assert!(!c.has_spawn(ChunkPos::new(2, 2)));
    }

    #[test]
    fn test_adjacent_chunks_are_linked_both_ways() {
        let mut c = coordinator();
        joined(&mut c, 1);

        commit_chunk(&mut c, ChunkPos::new(0, 0));
        let out = commit_chunk(&mut c, ChunkPos::new(1, 0));

        // One notice per direction.
        assert_eq!(out.len(), 2);
        let targets: Vec<&HostId> = out
            .iter()
            .map(|o| match &o.msg {
                Message::ToHost { target, .. } => target,
                other => panic!("expected envelope, got {:?}", other),
            })
            .collect();
        assert!(targets.contains(&&HostId::Chunk(ChunkPos::new(0, 0))));
        assert!(targets.contains(&&HostId::Chunk(ChunkPos::new(1, 0))));
    }

    #[test]
    fn test_distant_chunks_are_not_linked() {
        let mut c = coordinator();
        joined(&mut c, 1);

        commit_chunk(&mut c, ChunkPos::new(0, 0));
        let out = commit_chunk(&mut c, ChunkPos::new(5, 5));
        assert!(out.is_empty());
    }

    #[test]
    fn test_spawn_lands_in_a_spawn_capable_chunk() {
        let mut c = coordinator();
        joined(&mut c, 1);
        let id = PlayerId::new();
        commit_player(&mut c, ConnId(1), id);
        commit_chunk(&mut c, ChunkPos::new(1, 0)); // no spawn
        commit_chunk(&mut c, ChunkPos::new(0, 0)); // spawn

        let out = c.on_spawn_request(id).unwrap();
        assert_eq!(out.len(), 1);
        match &out[0].msg {
            Message::ToHost { target, inner } => {
                assert_eq!(*target, HostId::Chunk(ChunkPos::ORIGIN));
                assert!(matches!(**inner, Message::SpawnPlayer { .. }));
            }
            other => panic!("expected envelope, got {:?}", other),
        }
    }

    #[test]
    fn test_spawn_without_spawn_chunks_is_dropped() {
        let mut c = coordinator();
        joined(&mut c, 1);
        let id = PlayerId::new();
        commit_player(&mut c, ConnId(1), id);
        commit_chunk(&mut c, ChunkPos::new(1, 0)); // no spawn

        assert!(c.on_spawn_request(id).unwrap().is_empty());
        assert!(c.on_spawn_request(PlayerId::new()).unwrap().is_empty());
    }

    #[test]
    fn test_host_teardown_reassigns_at_next_generation() {
        let mut c = coordinator();
        joined(&mut c, 1);
        let id = PlayerId::new();
        let info = commit_player(&mut c, ConnId(1), id);

        let mut state = PlayerState::default();
        state.inventory.teleports = 9;
        let out = c
            .on_player_host_disconnect(info.clone(), state.clone())
            .unwrap();
        let action = action_of(&out);
        match &out[0].msg {
            Message::AssignPlayer {
                info: next, state: carried, ..
            } => {
                assert_eq!(next.generation, 1);
                assert_eq!(next.name, info.name);
                assert_eq!(carried, &state);
            }
            other => panic!("expected assignment, got {:?}", other),
        }

        c.on_response(action, ResultCode::Success).unwrap();
        assert_eq!(c.player_info(id).unwrap().generation, 1);
    }

    #[test]
    fn test_stale_host_teardown_is_ignored() {
        let mut c = coordinator();
        joined(&mut c, 1);
        let id = PlayerId::new();
        let info = commit_player(&mut c, ConnId(1), id);

        // Move the registry to generation 1.
        let out = c
            .on_player_host_disconnect(info.clone(), PlayerState::default())
            .unwrap();
        c.on_response(action_of(&out), ResultCode::Success).unwrap();

        // The generation-0 host reporting again changes nothing.
        let out = c
            .on_player_host_disconnect(info, PlayerState::default())
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(c.player_info(id).unwrap().generation, 1);
    }

    #[test]
    fn test_chunk_teardown_carries_snapshot_forward() {
        let mut c = coordinator();
        joined(&mut c, 2);
        commit_chunk(&mut c, ChunkPos::ORIGIN);
        let info = *c.chunk_info(ChunkPos::ORIGIN).unwrap();

        let snapshot = ChunkState {
            players: vec![PlayerId::new()],
            loot_teleports: 1,
            loot_blocks: 0,
        };
        let out = c
            .on_chunk_host_disconnect(ChunkInit {
                info,
                seed: 5,
                state: Some(snapshot.clone()),
            })
            .unwrap();
        match &out[0].msg {
            Message::AssignChunk { init, .. } => {
                assert_eq!(init.info.generation, 1);
                assert_eq!(init.state.as_ref(), Some(&snapshot));
            }
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_lost_validator_retries_inflight_assignment_at_same_generation() {
        let mut c = coordinator();
        let validators = joined(&mut c, 2);

        let id = PlayerId::new();
        let out = c.on_new_player_request(ConnId(1), addr(4000), id).unwrap();
        let first_target = out[0].to;

        let out = c.on_validator_lost(first_target).unwrap();
        assert_eq!(out.len(), 1);
        let second_target = out[0].to;
        assert_ne!(second_target, first_target);
        assert!(validators.contains(&second_target));
        match &out[0].msg {
            Message::AssignPlayer { info, .. } => {
                assert_eq!(info.generation, 0);
                // The agent is still waiting on its grant.
            }
            other => panic!("expected assignment, got {:?}", other),
        }

        let info = {
            let action = action_of(&out);
            let granted = c.on_response(action, ResultCode::Success).unwrap();
            assert_eq!(granted[0].to, ConnId(1));
            c.player_info(id).unwrap().clone()
        };
        assert_eq!(info.generation, 0);
    }

    #[test]
    fn test_lost_validator_reassigns_committed_owners_at_next_generation() {
        let mut c = coordinator();
        let validators = joined(&mut c, 2);

        let id = PlayerId::new();
        commit_player(&mut c, ConnId(1), id);
        commit_chunk(&mut c, ChunkPos::ORIGIN);

        let player_home = c.player_info(id).unwrap().validator_addr;
        let lost = *c
            .pool
            .iter()
            .find(|v| v.listen == player_home)
            .map(|v| &v.conn)
            .unwrap();
        let chunk_home = c.chunk_info(ChunkPos::ORIGIN).unwrap().validator_addr;

        let out = c.on_validator_lost(lost).unwrap();
        let expected = 1 + usize::from(chunk_home == player_home);
        assert_eq!(out.len(), expected);
        for o in &out {
            assert_ne!(o.to, lost);
            assert!(validators.contains(&o.to));
            match &o.msg {
                Message::AssignPlayer { info, .. } => assert_eq!(info.generation, 1),
                Message::AssignChunk { init, .. } => assert_eq!(init.info.generation, 1),
                other => panic!("expected assignment, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_graceful_leave_keeps_committed_owners() {
        let mut c = coordinator();
        let validators = joined(&mut c, 1);
        let id = PlayerId::new();
        commit_player(&mut c, ConnId(1), id);

        c.on_validator_leave(validators[0]);
        assert_eq!(c.pool_size(), 0);
        // The entity stays until its host reports teardown.
        assert_eq!(c.player_count(), 1);
    }

    #[test]
    fn test_unknown_response_action_is_a_violation() {
        let mut c = coordinator();
        let err = c
            .on_response(ActionId::new(), ResultCode::Success)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownAction(_)));
    }
}
