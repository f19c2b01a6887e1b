//! Single-writer ordered outbound delivery for one connection.
//!
//! All sends for a connection funnel through one unbounded FIFO consumed
//! by a dedicated writer task, so frames hit the socket strictly in
//! enqueue order and callers never block. `close` enqueues a sentinel:
//! everything queued before it is flushed, nothing after it is written.

use crate::codec::write_frame;
use crate::error::NetError;
use crate::messages::Message;
use log::{debug, warn};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

enum Frame {
    Outgoing(Message),
    Shutdown,
}

/// Handle to one connection's writer task. Cheap to clone; all clones
/// feed the same ordered queue.
#[derive(Clone)]
pub struct OutboundChannel {
    tx: mpsc::UnboundedSender<Frame>,
}

impl OutboundChannel {
    /// Spawns the writer loop over `writer`. On the first write failure
    /// `on_error` runs exactly once and the loop terminates; the channel
    /// is dead from then on and the connection should be discarded.
    pub fn start<W, F>(mut writer: W, on_error: F) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
        F: FnOnce(NetError) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut on_error = Some(on_error);

            while let Some(frame) = rx.recv().await {
                match frame {
                    Frame::Shutdown => {
                        debug!("outbound channel closed gracefully");
                        break;
                    }
                    Frame::Outgoing(msg) => {
                        if let Err(e) = write_frame(&mut writer, &msg).await {
                            if let Some(f) = on_error.take() {
                                f(e);
                            }
                            break;
                        }
                    }
                }
            }
        });

        Self { tx }
    }

    /// Appends a message to the queue. Non-blocking; never drops while
    /// the writer loop is alive.
    pub fn send(&self, msg: Message) {
        if self.tx.send(Frame::Outgoing(msg)).is_err() {
            warn!("send on dead outbound channel");
        }
    }

    /// Flushes everything already queued, then stops the writer loop.
    /// Messages sent after this are never written.
    pub fn close(&self) {
        let _ = self.tx.send(Frame::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::read_frame;
    use crate::error::NetError;
    use crate::ids::{ChunkPos, PlayerId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_messages_flushed_in_enqueue_order() {
        let (writer, mut reader) = tokio::io::duplex(65536);
        let channel = OutboundChannel::start(writer, |e| panic!("unexpected error: {}", e));

        let sent: Vec<Message> = (0..20)
            .map(|i| Message::NewChunkRequest {
                pos: ChunkPos::new(i, -i),
            })
            .collect();

        for msg in &sent {
            channel.send(msg.clone());
        }

        for msg in &sent {
            let got: Message = read_frame(&mut reader).await.unwrap();
            assert_eq!(&got, msg);
        }
    }

    #[tokio::test]
    async fn test_close_flushes_prior_sends_then_goes_silent() {
        let (writer, mut reader) = tokio::io::duplex(65536);
        let channel = OutboundChannel::start(writer, |e| panic!("unexpected error: {}", e));

        channel.send(Message::SpawnRequest);
        channel.send(Message::PickupTeleport);
        channel.close();
        channel.send(Message::PickupBlock); // must never hit the wire

        let first: Message = read_frame(&mut reader).await.unwrap();
        let second: Message = read_frame(&mut reader).await.unwrap();
        assert_eq!(first, Message::SpawnRequest);
        assert_eq!(second, Message::PickupTeleport);

        // Writer half is dropped once the loop exits, so the stream ends.
        let eof: Result<Message, NetError> = read_frame(&mut reader).await;
        assert!(eof.is_err());
    }

    #[tokio::test]
    async fn test_write_failure_reports_exactly_once() {
        let (writer, reader) = tokio::io::duplex(64);
        drop(reader); // every subsequent write fails

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        let channel = OutboundChannel::start(writer, move |_err| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            let _ = done_tx.send(());
        });

        channel.send(Message::NewPlayerRequest {
            player: PlayerId::new(),
        });
        channel.send(Message::SpawnRequest);

        tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .expect("error callback never fired")
            .unwrap();

        // Give the loop a moment to (incorrectly) fire again if it would.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clones_share_one_ordered_queue() {
        let (writer, mut reader) = tokio::io::duplex(65536);
        let a = OutboundChannel::start(writer, |e| panic!("unexpected error: {}", e));
        let b = a.clone();

        a.send(Message::PickupTeleport);
        b.send(Message::PickupBlock);
        a.send(Message::PlayerDisconnect);

        let expected = [
            Message::PickupTeleport,
            Message::PickupBlock,
            Message::PlayerDisconnect,
        ];
        for msg in expected {
            let got: Message = read_frame(&mut reader).await.unwrap();
            assert_eq!(got, msg);
        }
    }
}
