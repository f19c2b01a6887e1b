//! The validator node: sockets, the single message-processing loop and
//! the dial cache.
//!
//! Everything stateful funnels through one mpsc queue consumed by
//! `run`, so hosted owners are mutated from exactly one task and need no
//! locking. Reader tasks and the writer tasks behind `OutboundChannel`
//! only move frames.

use crate::chunk::ChunkValidator;
use crate::player::PlayerValidator;
use crate::routing::{Dest, DialSpec, Outgoing};
use log::{debug, error, info, warn};
use shared::channel::OutboundChannel;
use shared::codec::{read_frame, write_frame};
use shared::error::NetError;
use shared::ids::{ConnId, HostId};
use shared::messages::{Hello, Message, NodeRole, ResultCode};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::mpsc;

pub struct NodeConfig {
    pub listen: SocketAddr,
    pub server: SocketAddr,
}

type DialKey = (SocketAddr, HostId);

enum NodeEvent {
    Accepted { stream: TcpStream, hello: Hello },
    Dialed { key: DialKey, result: io::Result<TcpStream> },
    Frame { conn: ConnId, msg: Message },
    Closed { conn: ConnId },
}

enum Host {
    Player(PlayerValidator),
    Chunk(ChunkValidator),
}

impl Host {
    fn is_finalized(&self) -> bool {
        match self {
            Host::Player(p) => p.is_finalized(),
            Host::Chunk(c) => c.is_finalized(),
        }
    }
}

struct Conn {
    channel: OutboundChannel,
    /// The hosted owner this connection is attached to; `Process` for
    /// the coordinator link.
    owner: HostId,
    peer: NodeRole,
}

enum DialState {
    Pending {
        owner: HostId,
        spec: DialSpec,
        queued: Vec<Message>,
    },
    Ready(ConnId),
}

struct Node {
    events: mpsc::UnboundedSender<NodeEvent>,
    conns: HashMap<ConnId, Conn>,
    hosts: HashMap<HostId, Host>,
    /// Attached agent session per hosted player, for `Dest::Agent`.
    agents: HashMap<shared::ids::PlayerId, ConnId>,
    dials: HashMap<DialKey, DialState>,
    server_conn: ConnId,
    next_conn: u64,
    stopping: bool,
}

/// Binds the listener, joins the coordinator and drives the node until
/// shutdown completes or the coordinator link drops.
pub async fn run(config: NodeConfig) -> Result<(), NetError> {
    let listener = TcpListener::bind(config.listen).await?;
    let listen = listener.local_addr()?;
    info!("validator node listening on {}", listen);

    let (events, mut rx) = mpsc::unbounded_channel();
    let mut node = Node {
        events: events.clone(),
        conns: HashMap::new(),
        hosts: HashMap::new(),
        agents: HashMap::new(),
        dials: HashMap::new(),
        server_conn: ConnId(0),
        next_conn: 0,
        stopping: false,
    };

    let mut server = TcpStream::connect(config.server).await?;
    write_frame(
        &mut server,
        &Hello::new(NodeRole::Validator { listen }, HostId::Process),
    )
    .await?;
    node.server_conn = node.register(server, HostId::Process, NodeRole::Server);
    info!("joined coordinator at {}", config.server);

    spawn_accept_loop(listener, events);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                node.begin_shutdown();
            }
            ev = rx.recv() => match ev {
                Some(ev) => node.on_event(ev)?,
                None => break,
            }
        }

        if node.stopping && node.hosts.is_empty() {
            info!("all hosted owners relinquished, exiting");
            break;
        }
    }
    Ok(())
}

fn spawn_accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<NodeEvent>) {
    tokio::spawn(async move {
        loop {
            let (mut stream, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!("accept failed: {}", e);
                    break;
                }
            };
            let events = events.clone();
            tokio::spawn(async move {
                match read_frame::<_, Hello>(&mut stream).await {
                    Ok(hello) => {
                        let _ = events.send(NodeEvent::Accepted { stream, hello });
                    }
                    Err(e) => warn!("bad handshake from {}: {}", addr, e),
                }
            });
        }
    });
}

impl Node {
    fn on_event(&mut self, ev: NodeEvent) -> Result<(), NetError> {
        match ev {
            NodeEvent::Accepted { stream, hello } => self.on_accepted(stream, hello),
            NodeEvent::Dialed { key, result } => self.on_dialed(key, result),
            NodeEvent::Frame { conn, msg } => self.on_frame(conn, msg)?,
            NodeEvent::Closed { conn } => self.on_closed(conn)?,
        }
        Ok(())
    }

    /// Splits the stream into a reader task and a writer channel and
    /// books the connection. Both halves report through the event queue.
    fn register(&mut self, stream: TcpStream, owner: HostId, peer: NodeRole) -> ConnId {
        self.next_conn += 1;
        let conn = ConnId(self.next_conn);

        let (mut reader, writer) = stream.into_split();
        let events = self.events.clone();
        let channel = OutboundChannel::start(writer, move |e| {
            debug!("{}: write side failed: {}", conn, e);
            let _ = events.send(NodeEvent::Closed { conn });
        });

        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match read_frame::<_, Message>(&mut reader).await {
                    Ok(msg) => {
                        if events.send(NodeEvent::Frame { conn, msg }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("{}: read side closed: {}", conn, e);
                        let _ = events.send(NodeEvent::Closed { conn });
                        break;
                    }
                }
            }
        });

        self.conns.insert(conn, Conn { channel, owner, peer });
        conn
    }

    fn on_accepted(&mut self, stream: TcpStream, hello: Hello) {
        if hello.version != shared::PROTOCOL_VERSION {
            warn!(
                "{} speaks protocol v{}, expected v{}",
                hello.role,
                hello.version,
                shared::PROTOCOL_VERSION
            );
            return;
        }
        if !self.hosts.contains_key(&hello.target) {
            warn!(
                "{} connected for {}, which is not hosted here",
                hello.role, hello.target
            );
            return;
        }

        let role = hello.role.clone();
        let conn = self.register(stream, hello.target, hello.role);
        debug!("{}: {} attached to {}", conn, role, hello.target);

        // An agent attaching to its own player owner gets a state sync
        // straight away.
        if let (NodeRole::Agent(id), HostId::Player(owned)) = (&role, hello.target) {
            if *id == owned {
                self.agents.insert(owned, conn);
                if let Some(Host::Player(p)) = self.hosts.get(&hello.target) {
                    let effects = p.agent_connected();
                    self.execute(hello.target, effects);
                }
            }
        }
    }

    fn on_frame(&mut self, conn: ConnId, msg: Message) -> Result<(), NetError> {
        let Some(c) = self.conns.get(&conn) else {
            return Ok(()); // raced with a close
        };

        if conn == self.server_conn {
            self.on_server_frame(msg);
            return Ok(());
        }

        let owner = c.owner;
        let peer = c.peer.clone();
        self.dispatch(owner, conn, &peer, msg);
        Ok(())
    }

    /// Messages on the coordinator link: assignments, and envelopes for
    /// hosted owners.
    fn on_server_frame(&mut self, msg: Message) {
        match msg {
            Message::AssignPlayer {
                action,
                info,
                state,
            } => {
                let target = HostId::Player(info.id);
                if self.hosts.contains_key(&target) {
                    warn!("duplicate assignment of {}", info);
                } else {
                    info!("assigned {}", info);
                    self.hosts
                        .insert(target, Host::Player(PlayerValidator::new(info, state)));
                }
                self.reply_server(action);
            }
            Message::AssignChunk { action, init } => {
                let target = HostId::Chunk(init.info.pos);
                if self.hosts.contains_key(&target) {
                    warn!("duplicate assignment of {}", init.info);
                } else {
                    info!("assigned {}", init.info);
                    self.hosts
                        .insert(target, Host::Chunk(ChunkValidator::new(init)));
                }
                self.reply_server(action);
            }
            Message::ToHost { target, inner } => {
                if self.hosts.contains_key(&target) {
                    self.dispatch(target, self.server_conn, &NodeRole::Server, *inner);
                } else {
                    // Can race with an owner we just relinquished.
                    warn!("dropping {} for absent {}", inner.label(), target);
                }
            }
            other => warn!("unexpected {} from coordinator", other.label()),
        }
    }

    fn reply_server(&self, action: shared::ids::ActionId) {
        if let Some(c) = self.conns.get(&self.server_conn) {
            c.channel.send(Message::Response {
                action,
                result: ResultCode::Success,
                payload: Vec::new(),
            });
        }
    }

    /// Runs one message through a hosted owner and applies the outcome.
    /// A protocol violation costs the offending peer its connection, not
    /// the owner.
    fn dispatch(&mut self, owner: HostId, from: ConnId, peer: &NodeRole, msg: Message) {
        let Some(host) = self.hosts.get_mut(&owner) else {
            warn!("{} sent {} to absent {}", peer, msg.label(), owner);
            self.drop_conn(from);
            return;
        };

        let result = match host {
            Host::Player(p) => p.handle(from, peer, msg),
            Host::Chunk(c) => c.handle(from, peer, msg),
        };

        match result {
            Ok(effects) => {
                self.execute(owner, effects);
                self.reap(owner);
            }
            Err(e) => {
                error!("{}: protocol violation from {}: {}", owner, peer, e);
                self.drop_conn(from);
            }
        }
    }

    fn execute(&mut self, owner: HostId, effects: Vec<Outgoing>) {
        for Outgoing { dest, msg } in effects {
            match dest {
                Dest::Reply(conn) => match self.conns.get(&conn) {
                    Some(c) => c.channel.send(msg),
                    None => warn!("{}: reply on closed {}", owner, conn),
                },
                Dest::Server => {
                    if let Some(c) = self.conns.get(&self.server_conn) {
                        c.channel.send(msg);
                    }
                }
                Dest::Agent => {
                    let HostId::Player(id) = owner else {
                        continue;
                    };
                    match self.agents.get(&id).and_then(|c| self.conns.get(c)) {
                        Some(c) => c.channel.send(msg),
                        None => debug!("{}: no agent attached, dropped {}", owner, msg.label()),
                    }
                }
                Dest::Remote(spec) => self.send_remote(owner, spec, msg),
            }
        }
    }

    /// Delivery to a hosted owner on another node. Connections are dialed
    /// on first use and cached per (address, owner); messages queue while
    /// the dial is in flight.
    fn send_remote(&mut self, owner: HostId, spec: DialSpec, msg: Message) {
        let key = (spec.addr, spec.target);

        enum Route {
            Send(ConnId),
            Queue,
            Dial,
        }
        let route = match self.dials.get(&key) {
            Some(DialState::Ready(conn)) if self.conns.contains_key(conn) => Route::Send(*conn),
            Some(DialState::Pending { .. }) => Route::Queue,
            _ => Route::Dial,
        };

        match route {
            Route::Send(conn) => {
                if let Some(c) = self.conns.get(&conn) {
                    c.channel.send(msg);
                }
            }
            Route::Queue => {
                if let Some(DialState::Pending { queued, .. }) = self.dials.get_mut(&key) {
                    queued.push(msg);
                }
            }
            Route::Dial => {
                debug!("{}: dialing {} at {}", owner, spec.target, spec.addr);
                let hello = Hello::new(spec.hello_role.clone(), spec.target);
                self.dials.insert(
                    key,
                    DialState::Pending {
                        owner,
                        spec,
                        queued: vec![msg],
                    },
                );
                let events = self.events.clone();
                tokio::spawn(async move {
                    let result = async {
                        let mut stream = TcpStream::connect(key.0).await?;
                        write_frame(&mut stream, &hello)
                            .await
                            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                        Ok(stream)
                    }
                    .await;
                    let _ = events.send(NodeEvent::Dialed { key, result });
                });
            }
        }
    }

    fn on_dialed(&mut self, key: DialKey, result: io::Result<TcpStream>) {
        let Some(DialState::Pending {
            owner,
            spec,
            queued,
        }) = self.dials.remove(&key)
        else {
            return; // owner went away while the dial was in flight
        };

        match result {
            Ok(stream) => {
                let conn = self.register(stream, owner, spec.peer_role);
                self.dials.insert(key, DialState::Ready(conn));
                if let Some(c) = self.conns.get(&conn) {
                    for msg in queued {
                        c.channel.send(msg);
                    }
                }
            }
            Err(e) => {
                warn!("{}: dial to {} failed: {}", owner, key.0, e);
                self.peer_lost(owner, ConnId(0), &spec.peer_role);
            }
        }
    }

    fn on_closed(&mut self, conn: ConnId) -> Result<(), NetError> {
        if conn == self.server_conn {
            error!("coordinator connection lost");
            return Err(NetError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "coordinator connection lost",
            )));
        }
        if let Some((owner, peer)) = self.drop_conn(conn) {
            self.peer_lost(owner, conn, &peer);
        }
        Ok(())
    }

    /// Unbooks a connection and everything pointing at it.
    fn drop_conn(&mut self, conn: ConnId) -> Option<(HostId, NodeRole)> {
        let c = self.conns.remove(&conn)?;
        c.channel.close();
        self.agents.retain(|_, attached| *attached != conn);
        self.dials
            .retain(|_, state| !matches!(state, DialState::Ready(c) if *c == conn));
        Some((c.owner, c.peer))
    }

    /// Disconnect fallback for the hosted owner a connection belonged to.
    fn peer_lost(&mut self, owner: HostId, conn: ConnId, peer: &NodeRole) {
        let effects = match (self.hosts.get_mut(&owner), peer) {
            (Some(Host::Player(p)), NodeRole::ChunkValidator(_)) => p.peer_lost(conn),
            (Some(Host::Chunk(c)), NodeRole::PlayerValidator(info)) => {
                c.player_peer_lost(info.id)
            }
            _ => Vec::new(),
        };
        self.execute(owner, effects);
        self.reap(owner);
    }

    /// Retires a hosted owner once it has reported itself finalized.
    fn reap(&mut self, owner: HostId) {
        let finalized = self
            .hosts
            .get(&owner)
            .map(Host::is_finalized)
            .unwrap_or(false);
        if !finalized {
            return;
        }

        self.hosts.remove(&owner);
        info!("{} relinquished", owner);

        let stale: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(id, c)| c.owner == owner && **id != self.server_conn)
            .map(|(id, _)| *id)
            .collect();
        for conn in stale {
            self.drop_conn(conn);
        }
        self.dials.retain(|_, state| {
            !matches!(state, DialState::Pending { owner: o, .. } if *o == owner)
        });
    }

    /// Graceful exit: tell the coordinator, then finalize every hosted
    /// owner. Owners holding a lock finalize once it is released.
    fn begin_shutdown(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        info!("shutting down, relinquishing {} owners", self.hosts.len());

        if let Some(c) = self.conns.get(&self.server_conn) {
            c.channel.send(Message::StopValidating);
        }

        let owners: Vec<HostId> = self.hosts.keys().copied().collect();
        for owner in owners {
            let result = match self.hosts.get_mut(&owner) {
                Some(Host::Player(p)) => p.finalize(),
                Some(Host::Chunk(c)) => c.finalize(),
                None => continue,
            };
            match result {
                Ok(effects) => {
                    self.execute(owner, effects);
                    self.reap(owner);
                }
                Err(e) => warn!("{}: finalize refused: {}", owner, e),
            }
        }
    }
}
