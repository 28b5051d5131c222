//! Remote-peer actor
//!
//! Symmetric to the client actor, but each peer is another node on a
//! federation link. A reader task JSON-decodes frames onto the link's
//! inbound queue; a writer task multiplexes the outbound queue, the
//! inbound relay (feeding the node router), and the keep-alive ticker.
//! On link-up the two nodes exchange `{Name, Uuid, AvailableRooms}`
//! records: the child connects, the parent responds first, then the
//! child responds.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::client::{MAX_MESSAGE_SIZE, PING_PERIOD, PONG_WAIT, WRITE_WAIT};
use crate::error::AppError;
use crate::message::Message;
use crate::router::{NodeCommand, PeerLink};
use crate::types::{NodeId, RoomId};

/// Capacity of a link's outbound and inbound queues
pub const PEER_QUEUE_SIZE: usize = 64;

/// One room advertised over a federation link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomAd {
    #[serde(rename = "Uuid")]
    pub uuid: RoomId,
    #[serde(rename = "Name")]
    pub name: String,
}

/// The handshake record exchanged when a federation link comes up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerHello {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Uuid")]
    pub uuid: NodeId,
    #[serde(rename = "AvailableRooms")]
    pub available_rooms: Vec<RoomAd>,
}

/// Spawn the reader/writer pair for an established link
///
/// Returns the outbound sender the router enqueues wire-bound messages on.
pub fn spawn_link<S>(
    ws: WebSocketStream<S>,
    peer_id: NodeId,
    peer_name: String,
    node: mpsc::Sender<NodeCommand>,
) -> mpsc::Sender<Message>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(PEER_QUEUE_SIZE);
    let (inbound_tx, inbound_rx) = mpsc::channel(PEER_QUEUE_SIZE);
    tokio::spawn(read_socket(stream, peer_id, peer_name.clone(), inbound_tx, node.clone()));
    tokio::spawn(write_socket(sink, outbound_rx, inbound_rx, peer_name, node));
    outbound_tx
}

/// Read records off the wire onto the inbound queue
///
/// A frame that fails to decode terminates the link; peers that cannot
/// agree on the wire format are cut, not tolerated.
async fn read_socket<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    id: NodeId,
    name: String,
    inbound: mpsc::Sender<Message>,
    node: mpsc::Sender<NodeCommand>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // only a pong reply moves the deadline; a link that keeps relaying
    // records but never answers pings still expires
    let mut deadline = Instant::now() + PONG_WAIT;
    loop {
        let frame = match timeout_at(deadline, stream.next()).await {
            Err(_) => {
                debug!(peer = %name, "read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(peer = %name, error = %e, "read error");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            WsMessage::Text(text) => {
                if text.len() > MAX_MESSAGE_SIZE {
                    warn!(peer = %name, len = text.len(), "oversized frame, dropping link");
                    break;
                }
                match serde_json::from_str::<Message>(&text) {
                    Ok(msg) => {
                        if inbound.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(peer = %name, error = %e, "undecodable record, dropping link");
                        break;
                    }
                }
            }
            WsMessage::Close(_) => break,
            WsMessage::Pong(_) => deadline = Instant::now() + PONG_WAIT,
            WsMessage::Ping(_) => {}
            _ => {}
        }
    }

    let _ = node.send(NodeCommand::PeerClosed { id }).await;
    debug!(peer = %name, "peer reader exited");
}

/// Drive the wire: outbound queue to the socket, inbound queue to the
/// router, pings on the ticker
async fn write_socket<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut outbound: mpsc::Receiver<Message>,
    mut inbound: mpsc::Receiver<Message>,
    name: String,
    node: mpsc::Sender<NodeCommand>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ticker = interval(PING_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick completes immediately
    let mut inbound_open = true;

    loop {
        tokio::select! {
            item = outbound.recv() => match item {
                Some(msg) => {
                    let json = match msg.encode() {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(peer = %name, error = %e, "failed to encode record");
                            continue;
                        }
                    };
                    match timeout(WRITE_WAIT, sink.send(WsMessage::Text(json))).await {
                        Ok(Ok(())) => {}
                        _ => {
                            debug!(peer = %name, "cannot write to connection");
                            break;
                        }
                    }
                }
                None => {
                    // the router dropped the link
                    debug!(peer = %name, "link closed by router");
                    break;
                }
            },
            relayed = inbound.recv(), if inbound_open => match relayed {
                Some(msg) => {
                    // localbound relay: hand peer traffic to the router
                    if node.send(NodeCommand::Route(msg)).await.is_err() {
                        break;
                    }
                }
                None => inbound_open = false,
            },
            _ = ticker.tick() => {
                match timeout(WRITE_WAIT, sink.send(WsMessage::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => {
                        debug!(peer = %name, "failed to ping");
                        break;
                    }
                }
            }
        }
    }

    let _ = timeout(WRITE_WAIT, sink.close()).await;
    debug!(peer = %name, "peer writer exited");
}

/// Dial the parent node and bring the link up as its child
///
/// The parent responds with its hello first; we answer with ours, then
/// spawn the link tasks and hand the parent to the router.
pub async fn connect_to_parent(
    addr: &str,
    node: mpsc::Sender<NodeCommand>,
) -> Result<(), AppError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    node.send(NodeCommand::Hello { reply: reply_tx })
        .await
        .map_err(|_| AppError::ChannelSend)?;
    let our_hello = reply_rx.await.map_err(|_| AppError::ChannelSend)?;

    let url = format!("ws://{}/ws/server/{}/{}", addr, our_hello.uuid, our_hello.name);
    info!(url = %url, "connecting to parent");
    let (mut ws, _) = connect_async(url.as_str()).await?;

    // the parent responds first
    let parent_hello = read_hello(&mut ws).await?;
    // then the child responds
    let json = serde_json::to_string(&our_hello)?;
    ws.send(WsMessage::Text(json)).await?;

    info!(parent = %parent_hello.name, id = %parent_hello.uuid, "parent link up");
    let outbound = spawn_link(ws, parent_hello.uuid, parent_hello.name.clone(), node.clone());
    node.send(NodeCommand::SetParent {
        link: PeerLink {
            id: parent_hello.uuid,
            name: parent_hello.name,
            outbound,
            rooms: parent_hello.available_rooms,
        },
    })
    .await
    .map_err(|_| AppError::ChannelSend)?;
    Ok(())
}

/// Read one handshake record, skipping control frames
pub async fn read_hello<S>(ws: &mut WebSocketStream<S>) -> Result<PeerHello, AppError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = timeout(PONG_WAIT, ws.next())
            .await
            .map_err(|_| AppError::Handshake("timed out waiting for hello".to_string()))?
            .ok_or_else(|| AppError::Handshake("connection closed during handshake".to_string()))??;
        match frame {
            WsMessage::Text(text) => return Ok(serde_json::from_str(&text)?),
            WsMessage::Close(_) => {
                return Err(AppError::Handshake("connection closed during handshake".to_string()))
            }
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_wire_field_names() {
        let hello = PeerHello {
            name: "leaf".to_string(),
            uuid: NodeId::new(),
            available_rooms: vec![RoomAd { uuid: RoomId::new(), name: "x".to_string() }],
        };
        let json = serde_json::to_string(&hello).unwrap();
        assert!(json.contains("\"Name\":\"leaf\""));
        assert!(json.contains("\"Uuid\""));
        assert!(json.contains("\"AvailableRooms\""));
        assert!(json.contains("\"Name\":\"x\""));
    }

    #[test]
    fn test_hello_roundtrip() {
        let hello = PeerHello {
            name: "hub".to_string(),
            uuid: NodeId::new(),
            available_rooms: vec![],
        };
        let back: PeerHello = serde_json::from_str(&serde_json::to_string(&hello).unwrap()).unwrap();
        assert_eq!(back.uuid, hello.uuid);
        assert_eq!(back.name, "hub");
        assert!(back.available_rooms.is_empty());
    }
}
