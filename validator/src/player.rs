//! Player state owner: the lock-aware state machine guarding one
//! player's authoritative data.
//!
//! Lifecycle: Idle (serving) -> Locked (a chunk validator holds the
//! handoff lock; local mutations queue) -> Idle again on unlock, with the
//! queue drained in arrival order. An explicit finalize moves the owner
//! to Finalizing (no new work accepted) and then Finalized, deferred past
//! any outstanding lock, at which point teardown notifications fire
//! exactly once and the coordinator can reassign.

use crate::routing::{DialSpec, Outgoing};
use log::{info, warn};
use shared::error::ProtocolError;
use shared::ids::{ActionId, ConnId, HostId};
use shared::messages::{LockGrant, Message, NodeRole, ResultCode};
use shared::remote::ActionSlot;
use shared::state::{PlayerInfo, PlayerState};
use std::collections::VecDeque;

/// Local mutation deferred because the handoff lock was outstanding when
/// it arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DelayedOp {
    PickupTeleport,
    PickupBlock,
    Disconnect,
}

/// Context parked in the lock slot: the snapshot handed to the locker,
/// for the changed-state check on unlock.
#[derive(Debug)]
struct PendingLock {
    snapshot: PlayerState,
}

pub struct PlayerValidator {
    info: PlayerInfo,
    state: PlayerState,
    locked: ActionSlot<PendingLock>,
    delayed: VecDeque<DelayedOp>,
    finalizing: bool,
    finalized: bool,
}

impl PlayerValidator {
    pub fn new(info: PlayerInfo, state: PlayerState) -> Self {
        Self {
            info,
            state,
            locked: ActionSlot::new(),
            delayed: VecDeque::new(),
            finalizing: false,
            finalized: false,
        }
    }

    pub fn info(&self) -> &PlayerInfo {
        &self.info
    }

    pub fn state(&self) -> &PlayerState {
        &self.state
    }

    pub fn is_locked(&self) -> bool {
        self.locked.is_armed()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Fresh state broadcast for a newly attached agent session.
    pub fn agent_connected(&self) -> Vec<Outgoing> {
        vec![self.sync_agent()]
    }

    /// Dispatch for messages arriving from chunk validators. Anything
    /// else reaching a player owner is a wiring bug.
    pub fn handle(
        &mut self,
        from: ConnId,
        peer: &NodeRole,
        msg: Message,
    ) -> Result<Vec<Outgoing>, ProtocolError> {
        if !matches!(peer, NodeRole::ChunkValidator(_)) {
            return Err(ProtocolError::UnexpectedMessage {
                peer: peer.to_string(),
                msg: msg.label(),
            });
        }

        match msg {
            Message::LockState { action } => self.on_lock(from, action),
            Message::UnlockState { action, state } => self.on_unlock(action, state),
            Message::PickupTeleport => self.local_op(DelayedOp::PickupTeleport),
            Message::PickupBlock => self.local_op(DelayedOp::PickupBlock),
            Message::PlayerDisconnect => self.local_op(DelayedOp::Disconnect),
            other => Err(ProtocolError::UnexpectedMessage {
                peer: peer.to_string(),
                msg: other.label(),
            }),
        }
    }

    /// Lock acquisition: grant a snapshot iff no lock is held and we are
    /// not finalizing; otherwise the caller gets a recoverable Fail.
    fn on_lock(&mut self, from: ConnId, action: ActionId) -> Result<Vec<Outgoing>, ProtocolError> {
        if self.locked.is_armed() {
            info!("{}: already locked, refusing lock", self.info);
            return Ok(vec![Self::fail(from, action)]);
        }
        if self.finalizing {
            info!("{}: finalizing, refusing lock", self.info);
            return Ok(vec![Self::fail(from, action)]);
        }

        let unlock = ActionId::new();
        let grant = LockGrant {
            unlock,
            state: self.state.clone(),
        };
        self.locked.arm(
            unlock,
            from,
            PendingLock {
                snapshot: self.state.clone(),
            },
        )?;

        Ok(vec![Outgoing::reply(
            from,
            Message::Response {
                action,
                result: ResultCode::Success,
                payload: grant.encode()?,
            },
        )])
    }

    fn fail(from: ConnId, action: ActionId) -> Outgoing {
        Outgoing::reply(
            from,
            Message::Response {
                action,
                result: ResultCode::Fail,
                payload: Vec::new(),
            },
        )
    }

    /// Lock release: the returned state must differ from the snapshot we
    /// handed out; an unchanged round-trip means the locker coordinated
    /// for nothing and indicates a bug on its side. The check runs before
    /// the slot is consumed, so when the caller tears the connection down
    /// the holder's disconnect fallback still finds the lock armed and
    /// drains the queue.
    fn on_unlock(
        &mut self,
        action: ActionId,
        state: PlayerState,
    ) -> Result<Vec<Outgoing>, ProtocolError> {
        if state == self.locked.peek(action)?.snapshot {
            return Err(ProtocolError::UnchangedRoundTrip);
        }
        self.locked.complete(action)?;

        self.state = state;
        let mut out = vec![self.sync_agent()];
        out.extend(self.drain_delayed());

        if self.finalizing {
            out.extend(self.on_finalized());
        }
        Ok(out)
    }

    /// Local mutations run immediately while idle, queue while locked,
    /// and are dropped once finalization has begun.
    fn local_op(&mut self, op: DelayedOp) -> Result<Vec<Outgoing>, ProtocolError> {
        if self.finalizing {
            info!("{}: finalizing, ignored {:?}", self.info, op);
            return Ok(Vec::new());
        }

        if self.locked.is_armed() {
            self.delayed.push_back(op);
            return Ok(Vec::new());
        }

        Ok(self.apply(op))
    }

    fn apply(&mut self, op: DelayedOp) -> Vec<Outgoing> {
        match op {
            DelayedOp::PickupTeleport => self.state.inventory.teleports += 1,
            DelayedOp::PickupBlock => self.state.inventory.blocks += 1,
            DelayedOp::Disconnect => self.state.chunk = None,
        }
        vec![self.sync_agent()]
    }

    fn drain_delayed(&mut self) -> Vec<Outgoing> {
        let mut out = Vec::new();
        while let Some(op) = self.delayed.pop_front() {
            out.extend(self.apply(op));
        }
        out
    }

    /// Begins relinquishing ownership. Completes immediately when no lock
    /// is outstanding, otherwise waits for the unlock.
    pub fn finalize(&mut self) -> Result<Vec<Outgoing>, ProtocolError> {
        if self.finalizing {
            return Err(ProtocolError::DoubleFinalize);
        }
        self.finalizing = true;

        if self.locked.is_armed() {
            info!("{}: finalize deferred until unlock", self.info);
            return Ok(Vec::new());
        }
        Ok(self.on_finalized())
    }

    fn on_finalized(&mut self) -> Vec<Outgoing> {
        debug_assert!(self.finalizing && !self.locked.is_armed() && !self.finalized);
        self.finalized = true;

        let mut out = Vec::new();
        if let Some(chunk) = self.state.chunk {
            out.push(Outgoing::remote(
                DialSpec {
                    addr: chunk.validator_addr,
                    target: HostId::Chunk(chunk.pos),
                    hello_role: NodeRole::PlayerValidator(self.info.clone()),
                    peer_role: NodeRole::ChunkValidator(chunk),
                },
                Message::PlayerDisconnect,
            ));
            self.state.chunk = None;
            out.push(self.sync_agent());
        }

        out.push(Outgoing::server(Message::PlayerHostDisconnect {
            info: self.info.clone(),
            state: self.state.clone(),
        }));
        info!("{}: finalized", self.info);
        out
    }

    /// Disconnect fallback for the lock holder: the lock evaporates, the
    /// queue drains against the unmodified state, and a deferred finalize
    /// proceeds.
    pub fn peer_lost(&mut self, conn: ConnId) -> Vec<Outgoing> {
        let mut out = Vec::new();
        if self.locked.abandon(conn).is_some() {
            warn!("{}: lock holder disconnected, releasing lock", self.info);
            out.extend(self.drain_delayed());
            if self.finalizing && !self.finalized {
                out.extend(self.on_finalized());
            }
        }
        out
    }

    fn sync_agent(&self) -> Outgoing {
        Outgoing::agent(Message::PlayerSync {
            state: self.state.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::Dest;
    use shared::ids::{ChunkPos, PlayerId};
    use shared::state::ChunkInfo;

    fn player_info() -> PlayerInfo {
        PlayerInfo {
            id: PlayerId::new(),
            name: "A".to_string(),
            agent_addr: "127.0.0.1:4000".parse().unwrap(),
            validator_addr: "127.0.0.1:5000".parse().unwrap(),
            generation: 0,
        }
    }

    fn chunk_info() -> ChunkInfo {
        ChunkInfo {
            pos: ChunkPos::ORIGIN,
            validator_addr: "127.0.0.1:6000".parse().unwrap(),
            generation: 0,
            has_spawn: true,
        }
    }

    fn chunk_peer() -> NodeRole {
        NodeRole::ChunkValidator(chunk_info())
    }

    fn lock(v: &mut PlayerValidator, conn: ConnId) -> (ActionId, LockGrant) {
        let action = ActionId::new();
        let out = v
            .handle(conn, &chunk_peer(), Message::LockState { action })
            .unwrap();
        assert_eq!(out.len(), 1);
        match &out[0].msg {
            Message::Response {
                action: a,
                result: ResultCode::Success,
                payload,
            } => {
                assert_eq!(*a, action);
                (action, LockGrant::decode(payload).unwrap())
            }
            other => panic!("expected success response, got {:?}", other),
        }
    }

    fn modified(mut state: PlayerState) -> PlayerState {
        state.chunk = Some(chunk_info());
        state
    }

    #[test]
    fn test_lock_grants_current_snapshot() {
        let mut v = PlayerValidator::new(player_info(), PlayerState::default());
        let (_, grant) = lock(&mut v, ConnId(1));
        assert_eq!(grant.state, PlayerState::default());
        assert!(v.is_locked());
    }

    #[test]
    fn test_second_lock_fails_until_unlocked() {
        let mut v = PlayerValidator::new(player_info(), PlayerState::default());
        let (_, grant) = lock(&mut v, ConnId(1));

        // Contender is refused while the first lock is open.
        let contender = ActionId::new();
        let out = v
            .handle(ConnId(2), &chunk_peer(), Message::LockState { action: contender })
            .unwrap();
        assert!(matches!(
            out[0].msg,
            Message::Response {
                action,
                result: ResultCode::Fail,
                ..
            } if action == contender
        ));

        // First holder unlocks with a modified state.
        v.handle(
            ConnId(1),
            &chunk_peer(),
            Message::UnlockState {
                action: grant.unlock,
                state: modified(grant.state),
            },
        )
        .unwrap();
        assert!(!v.is_locked());

        // Now the contender can lock.
        lock(&mut v, ConnId(2));
    }

    #[test]
    fn test_unchanged_round_trip_is_fatal() {
        let mut v = PlayerValidator::new(player_info(), PlayerState::default());
        let (_, grant) = lock(&mut v, ConnId(1));

        let err = v
            .handle(
                ConnId(1),
                &chunk_peer(),
                Message::UnlockState {
                    action: grant.unlock,
                    state: grant.state,
                },
            )
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnchangedRoundTrip));
    }

    #[test]
    fn test_unchanged_round_trip_leaves_lock_for_disconnect_fallback() {
        let mut v = PlayerValidator::new(player_info(), PlayerState::default());
        let (_, grant) = lock(&mut v, ConnId(1));

        v.handle(ConnId(1), &chunk_peer(), Message::PickupTeleport)
            .unwrap();
        v.finalize().unwrap();

        let err = v
            .handle(
                ConnId(1),
                &chunk_peer(),
                Message::UnlockState {
                    action: grant.unlock,
                    state: grant.state,
                },
            )
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnchangedRoundTrip));

        // The lock is still armed, so tearing down the offending
        // connection drains the queue and completes the finalize.
        assert!(v.is_locked());
        let out = v.peer_lost(ConnId(1));
        assert!(v.is_finalized());
        assert_eq!(v.state().inventory.teleports, 6);
        assert_eq!(
            out.iter()
                .filter(|o| matches!(o.msg, Message::PlayerHostDisconnect { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn test_unlock_with_wrong_action_id_is_a_violation() {
        let mut v = PlayerValidator::new(player_info(), PlayerState::default());
        let (_, grant) = lock(&mut v, ConnId(1));

        let err = v
            .handle(
                ConnId(1),
                &chunk_peer(),
                Message::UnlockState {
                    action: ActionId::new(),
                    state: modified(grant.state),
                },
            )
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownAction(_)));
        assert!(v.is_locked());
    }

    #[test]
    fn test_operations_queue_while_locked_and_replay_fifo() {
        let mut v = PlayerValidator::new(player_info(), PlayerState::default());
        let (_, grant) = lock(&mut v, ConnId(1));

        assert!(v
            .handle(ConnId(1), &chunk_peer(), Message::PickupTeleport)
            .unwrap()
            .is_empty());
        assert!(v
            .handle(ConnId(1), &chunk_peer(), Message::PickupBlock)
            .unwrap()
            .is_empty());
        assert!(v
            .handle(ConnId(1), &chunk_peer(), Message::PickupTeleport)
            .unwrap()
            .is_empty());

        // Nothing applied yet.
        assert_eq!(v.state().inventory.teleports, 5);
        assert_eq!(v.state().inventory.blocks, 5);

        let out = v
            .handle(
                ConnId(1),
                &chunk_peer(),
                Message::UnlockState {
                    action: grant.unlock,
                    state: modified(grant.state),
                },
            )
            .unwrap();

        // One sync for the unlock itself plus one per replayed op.
        let syncs = out
            .iter()
            .filter(|o| matches!(o.msg, Message::PlayerSync { .. }))
            .count();
        assert_eq!(syncs, 4);
        assert_eq!(v.state().inventory.teleports, 7);
        assert_eq!(v.state().inventory.blocks, 6);
    }

    #[test]
    fn test_operations_apply_immediately_when_idle() {
        let mut v = PlayerValidator::new(player_info(), PlayerState::default());
        let out = v
            .handle(ConnId(1), &chunk_peer(), Message::PickupBlock)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].msg, Message::PlayerSync { .. }));
        assert_eq!(v.state().inventory.blocks, 6);
    }

    #[test]
    fn test_finalize_without_lock_completes_immediately() {
        let mut state = PlayerState::default();
        state.chunk = Some(chunk_info());
        let mut v = PlayerValidator::new(player_info(), state);

        let out = v.finalize().unwrap();
        assert!(v.is_finalized());

        // Disconnect to the chunk host, a sync, and the server notice.
        assert!(out
            .iter()
            .any(|o| matches!((&o.dest, &o.msg), (Dest::Remote(_), Message::PlayerDisconnect))));
        assert!(out
            .iter()
            .any(|o| matches!((&o.dest, &o.msg), (Dest::Server, Message::PlayerHostDisconnect { .. }))));
        assert!(!v.state().is_connected());
    }

    #[test]
    fn test_finalize_defers_until_unlock() {
        let mut v = PlayerValidator::new(player_info(), PlayerState::default());
        let (_, grant) = lock(&mut v, ConnId(1));

        assert!(v.finalize().unwrap().is_empty());
        assert!(!v.is_finalized());

        // New local operations are rejected while finalizing.
        assert!(v
            .handle(ConnId(1), &chunk_peer(), Message::PickupTeleport)
            .unwrap()
            .is_empty());

        let out = v
            .handle(
                ConnId(1),
                &chunk_peer(),
                Message::UnlockState {
                    action: grant.unlock,
                    state: modified(grant.state),
                },
            )
            .unwrap();
        assert!(v.is_finalized());

        let notices = out
            .iter()
            .filter(|o| matches!(o.msg, Message::PlayerHostDisconnect { .. }))
            .count();
        assert_eq!(notices, 1);
    }

    #[test]
    fn test_double_finalize_is_a_caller_error() {
        let mut v = PlayerValidator::new(player_info(), PlayerState::default());
        v.finalize().unwrap();
        assert!(matches!(v.finalize(), Err(ProtocolError::DoubleFinalize)));
    }

    #[test]
    fn test_lock_refused_while_finalizing() {
        let mut v = PlayerValidator::new(player_info(), PlayerState::default());
        let (_, grant) = lock(&mut v, ConnId(1));
        v.finalize().unwrap();

        let action = ActionId::new();
        let out = v
            .handle(ConnId(2), &chunk_peer(), Message::LockState { action })
            .unwrap();
        assert!(matches!(
            out[0].msg,
            Message::Response {
                result: ResultCode::Fail,
                ..
            }
        ));

        // Unlock still completes the deferred finalize.
        v.handle(
            ConnId(1),
            &chunk_peer(),
            Message::UnlockState {
                action: grant.unlock,
                state: modified(grant.state),
            },
        )
        .unwrap();
        assert!(v.is_finalized());
    }

    #[test]
    fn test_lock_holder_disconnect_releases_lock_and_drains_queue() {
        let mut v = PlayerValidator::new(player_info(), PlayerState::default());
        lock(&mut v, ConnId(1));

        v.handle(ConnId(1), &chunk_peer(), Message::PickupTeleport)
            .unwrap();

        let out = v.peer_lost(ConnId(1));
        assert!(!v.is_locked());
        assert_eq!(v.state().inventory.teleports, 6);
        assert_eq!(out.len(), 1); // the replayed pickup's sync

        // An unrelated connection loss is a no-op.
        assert!(v.peer_lost(ConnId(9)).is_empty());
    }

    #[test]
    fn test_lock_holder_disconnect_completes_deferred_finalize() {
        let mut v = PlayerValidator::new(player_info(), PlayerState::default());
        lock(&mut v, ConnId(1));
        v.finalize().unwrap();

        let out = v.peer_lost(ConnId(1));
        assert!(v.is_finalized());
        assert_eq!(
            out.iter()
                .filter(|o| matches!(o.msg, Message::PlayerHostDisconnect { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn test_messages_from_wrong_peer_are_violations() {
        let mut v = PlayerValidator::new(player_info(), PlayerState::default());
        let err = v
            .handle(ConnId(1), &NodeRole::Server, Message::PickupTeleport)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedMessage { .. }));
    }
}
