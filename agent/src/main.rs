//! Scripted player session: joins the world, watches its own state and
//! periodically picks up loot.
//!
//! The agent holds three connections: the coordinator (requests), its
//! player validator (state syncs) and the chunk it currently inhabits
//! (pickups). The last one is re-dialed whenever a sync moves the player
//! or the chunk owner changes generation.

use clap::Parser;
use log::{debug, info, warn};
use shared::codec::{read_frame, write_frame};
use shared::ids::{ChunkPos, HostId, PlayerId};
use shared::messages::{Hello, ItemKind, Message, NodeRole};
use shared::state::ChunkInfo;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Duration};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Coordinator address
    #[clap(short, long, default_value = "127.0.0.1:8080")]
    server: String,
    /// Milliseconds between pickup attempts
    #[clap(short, long, default_value = "1000")]
    pickup_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    env_logger::init();

    let id = PlayerId::new();
    let mut server = TcpStream::connect(&args.server).await?;
    write_frame(
        &mut server,
        &Hello::new(NodeRole::Agent(id), HostId::Process),
    )
    .await?;
    write_frame(&mut server, &Message::NewPlayerRequest { player: id }).await?;

    let info = loop {
        match read_frame::<_, Message>(&mut server).await? {
            Message::NewPlayerGranted { info } => break info,
            other => debug!("ignored {} while joining", other.label()),
        }
    };
    info!("joined as {}", info);

    // Attach to our state owner for syncs.
    let mut owner = TcpStream::connect(info.validator_addr).await?;
    write_frame(
        &mut owner,
        &Hello::new(NodeRole::Agent(id), HostId::Player(id)),
    )
    .await?;

    // Seed a small world, then ask to be placed in it.
    for pos in [ChunkPos::new(0, 0), ChunkPos::new(1, 0)] {
        write_frame(&mut server, &Message::NewChunkRequest { pos }).await?;
    }
    sleep(Duration::from_millis(300)).await;
    write_frame(&mut server, &Message::SpawnRequest).await?;

    // Frame reads span two awaits, so they cannot sit in a select branch
    // without risking a torn frame when the ticker fires mid-read. A
    // dedicated reader task forwards whole frames instead.
    let (frames, mut syncs) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            match read_frame::<_, Message>(&mut owner).await {
                Ok(msg) => {
                    if frames.send(msg).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("state owner connection closed: {}", e);
                    break;
                }
            }
        }
    });

    let mut chunk: Option<(ChunkInfo, TcpStream)> = None;
    let mut ticker = interval(Duration::from_millis(args.pickup_interval));
    let mut next_kind = ItemKind::Teleport;

    loop {
        tokio::select! {
            msg = syncs.recv() => match msg {
                Some(Message::PlayerSync { state }) => {
                    info!("state: {}", state);
                    let current = chunk.as_ref().map(|(c, _)| *c);
                    if state.chunk != current {
                        chunk = match state.chunk {
                            Some(ci) => attach_chunk(id, ci).await,
                            None => None,
                        };
                    }
                }
                Some(other) => debug!("ignored {} from owner", other.label()),
                None => break,
            },
            _ = ticker.tick() => {
                let mut lost = false;
                if let Some((ci, stream)) = &mut chunk {
                    let msg = Message::PickupRequest { kind: next_kind };
                    next_kind = match next_kind {
                        ItemKind::Teleport => ItemKind::Block,
                        ItemKind::Block => ItemKind::Teleport,
                    };
                    if let Err(e) = write_frame(stream, &msg).await {
                        warn!("lost chunk {}: {}", ci, e);
                        lost = true;
                    }
                }
                if lost {
                    chunk = None;
                }
            }
        }
    }
    Ok(())
}

async fn attach_chunk(id: PlayerId, info: ChunkInfo) -> Option<(ChunkInfo, TcpStream)> {
    let mut stream = match TcpStream::connect(info.validator_addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot reach {}: {}", info, e);
            return None;
        }
    };
    let hello = Hello::new(NodeRole::Agent(id), HostId::Chunk(info.pos));
    if let Err(e) = write_frame(&mut stream, &hello).await {
        warn!("handshake with {} failed: {}", info, e);
        return None;
    }
    info!("attached to {}", info);
    Some((info, stream))
}
