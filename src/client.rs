//! Client actor
//!
//! Two cooperating tasks front each connected WebSocket: a reader that
//! stamps inbound frames into [`Message`] records and feeds the owning
//! room's broadcast inbox, and a writer that multiplexes the outbound
//! queue, the keep-alive ticker, and the kick signal onto the socket.
//!
//! The tasks share no mutable state. The reader learns which room the
//! client is in (and its possibly-renamed nickname) through a watch
//! channel whose only writer is the room actor that currently owns the
//! client.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::message::Message;
use crate::room::RoomHandle;
use crate::types::ClientId;

/// Time allowed to read the next frame from the peer
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Time allowed to write a frame to the peer
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Ping interval; must be less than `PONG_WAIT`
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Maximum frame size accepted from a peer; larger frames are dropped
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// Capacity of each client's bounded outbound queue
pub const OUTBOUND_QUEUE_SIZE: usize = 32;

/// One item on a client's outbound queue
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A JSON record; bursts of these are batched into one text frame,
    /// newline-separated
    Record(Message),
    /// The raw room-name frame sent on a room switch so the client UI can
    /// retitle; always its own frame
    RoomName(String),
}

/// The client's current room and nickname, as assigned by the owning room
#[derive(Debug, Clone)]
pub struct Binding {
    pub room: RoomHandle,
    pub nickname: String,
}

/// The handle a room holds for each member
///
/// Moved between rooms on a switch. The `outbound` sender here is the only
/// strong sender for the client's queue, so dropping the handle closes the
/// queue and winds the writer down.
#[derive(Debug)]
pub struct ClientHandle {
    pub id: ClientId,
    pub nickname: String,
    pub outbound: mpsc::Sender<Outbound>,
    pub kick: mpsc::Sender<()>,
    pub binding: watch::Sender<Binding>,
}

/// Strip surrounding whitespace and collapse embedded newlines to spaces
///
/// Newlines are the in-frame record separator, so they can never appear in
/// message content.
pub fn sanitize(text: &str) -> String {
    text.replace('\n', " ").trim().to_string()
}

/// Wrap a message as a server-to-client DM
pub fn server_dm(mut message: Message) -> Outbound {
    message.content = format!("(DM) {}", message.content);
    message.is_direct_message = true;
    Outbound::Record(message)
}

/// Wrap a message as a client-to-client DM
pub fn client_dm(nick: &str, mut message: Message) -> Outbound {
    message.content = format!("({}) {}", nick, message.content);
    message.is_direct_message = true;
    Outbound::Record(message)
}

/// Reads incoming frames from the client for relaying to its room
///
/// On read failure, EOF, or an expired deadline the reader enqueues an
/// unregister on the client's current room and exits; the writer then
/// winds down through queue closure.
pub async fn read_socket(
    mut stream: SplitStream<WebSocketStream<TcpStream>>,
    id: ClientId,
    binding: watch::Receiver<Binding>,
) {
    // only a pong reply moves the deadline; a peer that keeps sending
    // chat but never answers pings still expires
    let mut deadline = Instant::now() + PONG_WAIT;
    loop {
        let frame = match timeout_at(deadline, stream.next()).await {
            Err(_) => {
                debug!(client = %id, "read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(client = %id, error = %e, "read error");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            WsMessage::Text(text) => {
                if text.len() > MAX_MESSAGE_SIZE {
                    warn!(client = %id, len = text.len(), "dropping oversized frame");
                    continue;
                }
                let (room, nickname) = {
                    let bound = binding.borrow();
                    (bound.room.clone(), bound.nickname.clone())
                };
                let msg = Message::new(id.0, nickname, sanitize(&text), room.name.clone());
                if room.broadcast.send(msg).await.is_err() {
                    break;
                }
            }
            WsMessage::Close(_) => break,
            WsMessage::Pong(_) => deadline = Instant::now() + PONG_WAIT,
            // tungstenite queues the pong reply to an inbound ping itself
            WsMessage::Ping(_) => {}
            _ => {}
        }
    }

    let room = binding.borrow().room.clone();
    let _ = room.unregister.send(id).await;
    debug!(client = %id, "reader exited");
}

/// Moves records from the outbound queue to the socket
///
/// Multiplexes three sources: queue delivery (with burst batching into a
/// single frame), the keep-alive ticker, and the kick signal. Terminates
/// on queue closure, write failure, or kick; always sends a close frame
/// on the way out.
pub async fn write_socket(
    mut sink: SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    mut outbound: mpsc::Receiver<Outbound>,
    mut kick: mpsc::Receiver<()>,
    id: ClientId,
) {
    let mut ticker = interval(PING_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick completes immediately
    let mut kick_open = true;

    loop {
        tokio::select! {
            item = outbound.recv() => match item {
                Some(Outbound::Record(first)) => {
                    if deliver_burst(&mut sink, &mut outbound, first).await.is_err() {
                        debug!(client = %id, "cannot write to connection");
                        break;
                    }
                }
                Some(Outbound::RoomName(name)) => {
                    if send_text(&mut sink, name).await.is_err() {
                        debug!(client = %id, "cannot write to connection");
                        break;
                    }
                }
                None => {
                    // room closed the queue
                    debug!(client = %id, "queue closed");
                    break;
                }
            },
            _ = ticker.tick() => {
                if send_frame(&mut sink, WsMessage::Ping(Vec::new())).await.is_err() {
                    debug!(client = %id, "failed to ping");
                    break;
                }
            }
            kicked = kick.recv(), if kick_open => match kicked {
                Some(()) => {
                    debug!(client = %id, "kicked");
                    break;
                }
                None => kick_open = false,
            },
        }
    }

    let _ = timeout(WRITE_WAIT, sink.close()).await;
    debug!(client = %id, "writer exited");
}

/// Write the first record plus everything currently queued behind it into
/// one text frame, newline-separated
async fn deliver_burst(
    sink: &mut SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    outbound: &mut mpsc::Receiver<Outbound>,
    first: Message,
) -> Result<(), AppError> {
    let mut batch = vec![first];
    let mut retitle = None;
    while let Ok(next) = outbound.try_recv() {
        match next {
            Outbound::Record(msg) => batch.push(msg),
            Outbound::RoomName(name) => {
                // raw frames are never merged into a record frame
                retitle = Some(name);
                break;
            }
        }
    }
    send_text(sink, Message::encode_batch(&batch)?).await?;
    if let Some(name) = retitle {
        send_text(sink, name).await?;
    }
    Ok(())
}

async fn send_text(
    sink: &mut SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    text: String,
) -> Result<(), AppError> {
    send_frame(sink, WsMessage::Text(text)).await
}

async fn send_frame(
    sink: &mut SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    frame: WsMessage,
) -> Result<(), AppError> {
    match timeout(WRITE_WAIT, sink.send(frame)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(AppError::WriteTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_sanitize_trims_and_collapses() {
        assert_eq!(sanitize("  hello  "), "hello");
        assert_eq!(sanitize("a\nb\nc"), "a b c");
        assert_eq!(sanitize("\nhi\n"), "hi");
        assert_eq!(sanitize(""), "");
    }

    #[test]
    fn test_server_dm_prefix() {
        let msg = Message::new(Uuid::new_v4(), "main", "hello", "main");
        match server_dm(msg) {
            Outbound::Record(dm) => {
                assert_eq!(dm.content, "(DM) hello");
                assert!(dm.is_direct_message);
            }
            other => panic!("unexpected outbound item: {:?}", other),
        }
    }

    #[test]
    fn test_client_dm_prefix() {
        let msg = Message::new(Uuid::new_v4(), "alice", "psst", "main");
        match client_dm("bob", msg) {
            Outbound::Record(dm) => {
                assert_eq!(dm.content, "(bob) psst");
                assert!(dm.is_direct_message);
            }
            other => panic!("unexpected outbound item: {:?}", other),
        }
    }
}
