//! Remote-action bookkeeping: correlating requests with their eventual
//! completion.
//!
//! A pending action owns a continuation context `C` that is moved out on
//! completion, so the continuation runs exactly once — on a matching
//! response, or on the disconnect-fallback path, never both. There is no
//! timeout path: an action terminates only when its response arrives or
//! its peer is observed gone.

use crate::error::ProtocolError;
use crate::ids::{ActionId, ConnId};
use std::collections::HashMap;
use std::hash::Hash;

/// At most one outstanding action per guarded resource. State owners use
/// this for the single lock that may be held against their state.
#[derive(Debug, Default)]
pub struct ActionSlot<C> {
    pending: Option<Pending<C>>,
}

#[derive(Debug)]
struct Pending<C> {
    id: ActionId,
    holder: ConnId,
    ctx: C,
}

impl<C> ActionSlot<C> {
    pub fn new() -> Self {
        Self { pending: None }
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    pub fn holder(&self) -> Option<ConnId> {
        self.pending.as_ref().map(|p| p.holder)
    }

    /// Records an outstanding action. Arming an already-armed slot is a
    /// caller bug, not contention; contention is rejected before arming.
    pub fn arm(&mut self, id: ActionId, holder: ConnId, ctx: C) -> Result<(), ProtocolError> {
        if let Some(p) = &self.pending {
            return Err(ProtocolError::SlotOccupied(p.id));
        }
        self.pending = Some(Pending { id, holder, ctx });
        Ok(())
    }

    /// Reads the context without consuming it, so a caller can validate
    /// the completion payload first and leave the slot armed for the
    /// disconnect fallback when validation fails.
    pub fn peek(&self, id: ActionId) -> Result<&C, ProtocolError> {
        match &self.pending {
            Some(p) if p.id == id => Ok(&p.ctx),
            _ => Err(ProtocolError::UnknownAction(id)),
        }
    }

    /// Completion path: clears the slot and hands back the context. A
    /// response that matches nothing is a protocol violation; the slot is
    /// left untouched in that case.
    pub fn complete(&mut self, id: ActionId) -> Result<C, ProtocolError> {
        match self.pending.take() {
            Some(p) if p.id == id => Ok(p.ctx),
            Some(p) => {
                self.pending = Some(p);
                Err(ProtocolError::UnknownAction(id))
            }
            None => Err(ProtocolError::UnknownAction(id)),
        }
    }

    /// Disconnect-fallback path: clears the slot only if it is held by
    /// the lost connection.
    pub fn abandon(&mut self, holder: ConnId) -> Option<C> {
        if self.pending.as_ref().map(|p| p.holder) == Some(holder) {
            self.pending.take().map(|p| p.ctx)
        } else {
            None
        }
    }
}

/// Multi-action variant keyed by correlation id, tracking which peer each
/// action is outstanding against. `T` is the peer key: a connection id
/// for the coordinator, an entity id for owners that dial on demand.
#[derive(Debug)]
pub struct ActionRepository<T, C> {
    pending: HashMap<ActionId, (T, C)>,
}

impl<T: Eq + Hash + Copy, C> ActionRepository<T, C> {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn insert(&mut self, id: ActionId, target: T, ctx: C) -> Result<(), ProtocolError> {
        if self.pending.contains_key(&id) {
            return Err(ProtocolError::SlotOccupied(id));
        }
        self.pending.insert(id, (target, ctx));
        Ok(())
    }

    pub fn complete(&mut self, id: ActionId) -> Result<C, ProtocolError> {
        self.pending
            .remove(&id)
            .map(|(_, ctx)| ctx)
            .ok_or(ProtocolError::UnknownAction(id))
    }

    /// Mutable walk over the outstanding contexts, for callers that need
    /// to amend an action already in flight.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ActionId, &mut C)> {
        self.pending.iter_mut().map(|(id, (_, ctx))| (*id, ctx))
    }

    /// Drains every action outstanding against `target`; the caller runs
    /// the disconnect fallback for each returned context.
    pub fn fail_target(&mut self, target: T) -> Vec<(ActionId, C)> {
        let ids: Vec<ActionId> = self
            .pending
            .iter()
            .filter(|(_, (t, _))| *t == target)
            .map(|(id, _)| *id)
            .collect();

        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|(_, ctx)| (id, ctx)))
            .collect()
    }
}

impl<T: Eq + Hash + Copy, C> Default for ActionRepository<T, C> {
    fn default() -> Self {
        Self::new()
    }
}
