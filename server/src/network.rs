//! Listener and connection bookkeeping around the coordinator.
//!
//! Mirrors the validator node's loop: reader tasks and writer channels
//! move frames, one mpsc queue serializes everything touching the
//! coordinator state machine.

use crate::coordinator::{Coordinator, Outgoing};
use log::{debug, error, info, warn};
use shared::channel::OutboundChannel;
use shared::codec::read_frame;
use shared::error::NetError;
use shared::ids::{ConnId, HostId};
use shared::messages::{Hello, Message, NodeRole};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::mpsc;

enum Event {
    Accepted {
        stream: TcpStream,
        addr: SocketAddr,
        hello: Hello,
    },
    Frame {
        conn: ConnId,
        msg: Message,
    },
    Closed {
        conn: ConnId,
    },
}

struct Conn {
    channel: OutboundChannel,
    role: NodeRole,
    addr: SocketAddr,
}

pub struct Server {
    local_addr: SocketAddr,
    coordinator: Coordinator,
    conns: HashMap<ConnId, Conn>,
    events: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    next_conn: u64,
}

impl Server {
    /// Binds the listener and starts accepting; `run` drives everything
    /// else.
    pub async fn bind(listen: SocketAddr, coordinator: Coordinator) -> Result<Server, NetError> {
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;
        info!("coordinator listening on {}", local_addr);

        let (events, rx) = mpsc::unbounded_channel();
        spawn_accept_loop(listener, events.clone());

        Ok(Server {
            local_addr,
            coordinator,
            conns: HashMap::new(),
            events,
            rx,
            next_conn: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(mut self) -> Result<(), NetError> {
        loop {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    info!("shutting down");
                    return Ok(());
                }
                ev = self.rx.recv() => match ev {
                    Some(ev) => self.on_event(ev),
                    None => return Ok(()),
                }
            }
        }
    }

    fn on_event(&mut self, ev: Event) {
        match ev {
            Event::Accepted {
                stream,
                addr,
                hello,
            } => self.on_accepted(stream, addr, hello),
            Event::Frame { conn, msg } => self.on_frame(conn, msg),
            Event::Closed { conn } => self.on_closed(conn),
        }
    }

    fn on_accepted(&mut self, stream: TcpStream, addr: SocketAddr, hello: Hello) {
        if hello.version != shared::PROTOCOL_VERSION {
            warn!(
                "{} from {} speaks protocol v{}, expected v{}",
                hello.role,
                addr,
                hello.version,
                shared::PROTOCOL_VERSION
            );
            return;
        }
        if hello.target != HostId::Process {
            warn!("{} from {} addressed {}, dropped", hello.role, addr, hello.target);
            return;
        }
        match hello.role {
            NodeRole::Agent(_) | NodeRole::Validator { .. } => {}
            other => {
                warn!("{} from {} cannot attach here, dropped", other, addr);
                return;
            }
        }

        self.next_conn += 1;
        let conn = ConnId(self.next_conn);

        let (mut reader, writer) = stream.into_split();
        let events = self.events.clone();
        let channel = OutboundChannel::start(writer, move |e| {
            debug!("{}: write side failed: {}", conn, e);
            let _ = events.send(Event::Closed { conn });
        });

        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match read_frame::<_, Message>(&mut reader).await {
                    Ok(msg) => {
                        if events.send(Event::Frame { conn, msg }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("{}: read side closed: {}", conn, e);
                        let _ = events.send(Event::Closed { conn });
                        break;
                    }
                }
            }
        });

        debug!("{}: {} attached from {}", conn, hello.role, addr);
        let role = hello.role.clone();
        self.conns.insert(
            conn,
            Conn {
                channel,
                role: hello.role,
                addr,
            },
        );
        // Registered first: a join can replay parked assignments straight
        // onto the new connection.
        if let NodeRole::Validator { listen } = role {
            match self.coordinator.on_validator_join(conn, listen) {
                Ok(effects) => self.execute(effects),
                Err(e) => error!("replaying parked assignments to {} failed: {}", conn, e),
            }
        }
    }

    fn on_frame(&mut self, conn: ConnId, msg: Message) {
        let Some(c) = self.conns.get(&conn) else {
            return; // raced with a close
        };
        let role = c.role.clone();
        let addr = c.addr;

        let result = match (&role, msg) {
            (NodeRole::Validator { .. }, Message::Response { action, result, .. }) => {
                self.coordinator.on_response(action, result)
            }
            (NodeRole::Validator { .. }, Message::StopValidating) => {
                self.coordinator.on_validator_leave(conn);
                Ok(Vec::new())
            }
            (NodeRole::Validator { .. }, Message::PlayerHostDisconnect { info, state }) => {
                self.coordinator.on_player_host_disconnect(info, state)
            }
            (NodeRole::Validator { .. }, Message::ChunkHostDisconnect { init }) => {
                self.coordinator.on_chunk_host_disconnect(init)
            }
            (NodeRole::Agent(id), Message::NewPlayerRequest { player }) => {
                if *id != player {
                    warn!("{}: agent {} requested foreign player {}", conn, id, player);
                    Ok(Vec::new())
                } else {
                    self.coordinator.on_new_player_request(conn, addr, player)
                }
            }
            (NodeRole::Agent(_), Message::NewChunkRequest { pos }) => {
                self.coordinator.on_new_chunk_request(pos)
            }
            (NodeRole::Agent(id), Message::SpawnRequest) => self.coordinator.on_spawn_request(*id),
            (role, msg) => {
                warn!("{}: unexpected {} from {}", conn, msg.label(), role);
                Ok(Vec::new())
            }
        };

        match result {
            Ok(effects) => self.execute(effects),
            Err(e) => {
                error!("{}: protocol violation from {}: {}", conn, role, e);
                self.drop_conn(conn);
            }
        }
    }

    fn on_closed(&mut self, conn: ConnId) {
        let Some(c) = self.drop_conn(conn) else {
            return;
        };
        if matches!(c.role, NodeRole::Validator { .. }) {
            match self.coordinator.on_validator_lost(conn) {
                Ok(effects) => self.execute(effects),
                Err(e) => error!("reassignment after losing {} failed: {}", conn, e),
            }
        }
    }

    fn drop_conn(&mut self, conn: ConnId) -> Option<Conn> {
        let c = self.conns.remove(&conn)?;
        c.channel.close();
        Some(c)
    }

    fn execute(&mut self, effects: Vec<Outgoing>) {
        for Outgoing { to, msg } in effects {
            match self.conns.get(&to) {
                Some(c) => c.channel.send(msg),
                None => warn!("dropping {} for closed {}", msg.label(), to),
            }
        }
    }
}

fn spawn_accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<Event>) {
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
                        let _ = events.send(Event::Accepted {
                            stream,
                            addr,
                            hello,
                        });
                    }
                    Err(e) => warn!("bad handshake from {}: {}", addr, e),
                }
            });
        }
    });
}
