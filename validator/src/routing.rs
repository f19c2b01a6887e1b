//! Routing instructions emitted by hosted state owners.
//!
//! Owners never touch sockets. They return `Outgoing` values and the node
//! loop delivers them: straight back on the triggering connection, to the
//! coordinator, to the player's attached agent, or to a remote hosted
//! owner through the dial cache.

use shared::ids::{ConnId, HostId};
use shared::messages::{Message, NodeRole};
use std::net::SocketAddr;

/// Everything the node needs to reach a remote hosted owner: where it
/// lives, which owner to address, what we claim to be when dialing, and
/// what the remote end is for disconnect bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct DialSpec {
    pub addr: SocketAddr,
    pub target: HostId,
    pub hello_role: NodeRole,
    pub peer_role: NodeRole,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dest {
    /// The connection the triggering frame arrived on.
    Reply(ConnId),
    /// The coordinator, over the process connection.
    Server,
    /// The owning player's attached agent session; silently dropped when
    /// no agent is connected.
    Agent,
    /// A hosted owner on another node, dialed on demand.
    Remote(DialSpec),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub dest: Dest,
    pub msg: Message,
}

impl Outgoing {
    pub fn reply(conn: ConnId, msg: Message) -> Self {
        Self {
            dest: Dest::Reply(conn),
            msg,
        }
    }

    pub fn server(msg: Message) -> Self {
        Self {
            dest: Dest::Server,
            msg,
        }
    }

    pub fn agent(msg: Message) -> Self {
        Self {
            dest: Dest::Agent,
            msg,
        }
    }

    pub fn remote(spec: DialSpec, msg: Message) -> Self {
        Self {
            dest: Dest::Remote(spec),
            msg,
        }
    }
}
