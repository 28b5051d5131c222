//! Ingress façade
//!
//! Per-connection entry point: answers plain HTTP requests (the landing
//! page, or a 404) straight off the raw stream, performs the WebSocket
//! handshake for genuine upgrade requests while capturing the request
//! path, and dispatches the three `/ws/` URL shapes onto the right actor
//! — a client bound to a named room, a client bound to the DM room for a
//! pair of nicknames, or a child side of federation.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::client::{self, Binding, ClientHandle, OUTBOUND_QUEUE_SIZE, PONG_WAIT};
use crate::error::AppError;
use crate::peer;
use crate::room::RoomHandle;
use crate::router::{NodeCommand, PeerLink};
use crate::types::{ClientId, NodeId};

/// Minimal page served to plain HTTP requests on `/`
const LANDING_PAGE: &str = "<!DOCTYPE html>\n<html>\n<head><title>chatnode</title></head>\n<body>\n<h1>chatnode</h1>\n<p>This node is running. Connect a WebSocket client to\n<code>/ws/client/{room}?nickname=you</code>.</p>\n</body>\n</html>\n";

/// Largest request head examined when sniffing for an upgrade
const MAX_REQUEST_HEAD: usize = 2048;

/// Where a request wants to go
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    /// `GET /` without an upgrade
    Landing,
    /// `GET /ws/client/{room}?nickname=<n>`
    Client { room: String, nickname: String },
    /// `GET /ws/client/{src}/{dst}?nickname=<n>`
    DmPair {
        source: String,
        target: String,
        nickname: String,
    },
    /// `GET /ws/server/{uuid}/{name}`
    Peer { id: NodeId, name: String },
    NotFound,
}

/// Parse a request path (with optional query) into a dispatch target
fn parse_target(path_and_query: &str) -> Target {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, query),
        None => (path_and_query, ""),
    };
    if path == "/" {
        return Target::Landing;
    }

    let nickname = nickname_from_query(query);
    let segments: Vec<&str> = path.trim_start_matches('/').trim_end_matches('/').split('/').collect();
    match segments.as_slice() {
        ["ws", "client", room] if !room.is_empty() => Target::Client {
            room: (*room).to_string(),
            nickname,
        },
        ["ws", "client", source, target] if !source.is_empty() && !target.is_empty() => {
            Target::DmPair {
                source: (*source).to_string(),
                target: (*target).to_string(),
                nickname,
            }
        }
        ["ws", "server", uuid, name] => match uuid.parse::<Uuid>() {
            Ok(id) => Target::Peer {
                id: NodeId(id),
                name: (*name).to_string(),
            },
            Err(_) => Target::NotFound,
        },
        _ => Target::NotFound,
    }
}

/// Pull the `nickname` query parameter, replacing spaces with underscores
fn nickname_from_query(query: &str) -> String {
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("nickname=") {
            return value.replace([' ', '+'], "_");
        }
    }
    String::new()
}

/// Peek at the request head without consuming it; true when the client
/// is asking for a WebSocket upgrade
///
/// tungstenite rejects non-upgrade requests before the handshake
/// callback runs, so plain HTTP has to be recognized on the raw stream.
async fn wants_upgrade(stream: &TcpStream) -> Result<bool, AppError> {
    let mut buf = [0u8; MAX_REQUEST_HEAD];
    let mut seen = 0;
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(false);
        }
        if buf[..n].windows(4).any(|w| w == b"\r\n\r\n") || n == buf.len() {
            let head = String::from_utf8_lossy(&buf[..n]).to_ascii_lowercase();
            return Ok(head.contains("\r\nupgrade:") && head.contains("websocket"));
        }
        if n == seen {
            // the head is still in flight; peeking again would spin
            sleep(Duration::from_millis(10)).await;
        }
        seen = n;
    }
}

/// Answer a plain HTTP request with the landing page or a 404 and close
async fn serve_plain_http(mut stream: TcpStream, peer_addr: &str) -> Result<(), AppError> {
    // consume the request head before answering
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    let mut read = 0;
    while read < buf.len() {
        let n = stream.read(&mut buf[read..]).await?;
        if n == 0 {
            break;
        }
        read += n;
        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    let head = String::from_utf8_lossy(&buf[..read]);
    let path = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");
    let (status, body) = match parse_target(path) {
        Target::Landing => ("200 OK", LANDING_PAGE),
        _ => ("404 Not Found", "Not found\n"),
    };
    debug!(peer = %peer_addr, path = %path, status = %status, "served plain HTTP request");

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Handle a new TCP connection
///
/// Serves plain HTTP requests directly, performs the WebSocket handshake
/// for upgrade requests, then hands the upgraded socket to the right
/// actor.
pub async fn handle_connection(
    stream: TcpStream,
    node: mpsc::Sender<NodeCommand>,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    debug!(peer = %peer_addr, "new TCP connection");

    let upgrade = match timeout(PONG_WAIT, wants_upgrade(&stream)).await {
        Ok(result) => result?,
        Err(_) => {
            debug!(peer = %peer_addr, "request head never arrived");
            return Ok(());
        }
    };
    if !upgrade {
        return serve_plain_http(stream, &peer_addr).await;
    }

    let mut requested: Option<String> = None;
    let callback = |req: &Request, resp: Response| {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| req.uri().path().to_string());
        let target = parse_target(&path_and_query);
        requested = Some(path_and_query);
        match target {
            // an upgrade aimed at a page path still gets the page body
            Target::Landing => Err(page_response(StatusCode::OK, LANDING_PAGE)),
            Target::NotFound => Err(page_response(StatusCode::NOT_FOUND, "Not found\n")),
            _ => Ok(resp),
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(WsError::Http(_)) => {
            // upgrade to a page path; the rejection response was written
            debug!(peer = %peer_addr, "rejected upgrade to page path");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let Some(path_and_query) = requested else {
        return Ok(());
    };

    match parse_target(&path_and_query) {
        Target::Client { room, nickname } => {
            let (tx, rx) = oneshot::channel();
            node.send(NodeCommand::OpenRoom { name: room, reply: tx })
                .await
                .map_err(|_| AppError::ChannelSend)?;
            let room = rx.await.map_err(|_| AppError::ChannelSend)?;
            attach_client(ws, room, nickname).await
        }
        Target::DmPair { source, target, nickname } => {
            let (tx, rx) = oneshot::channel();
            node.send(NodeCommand::OpenDmRoom { source, target, reply: tx })
                .await
                .map_err(|_| AppError::ChannelSend)?;
            let room = rx.await.map_err(|_| AppError::ChannelSend)?;
            attach_client(ws, room, nickname).await
        }
        Target::Peer { id, name } => accept_peer(ws, id, name, node).await,
        Target::Landing | Target::NotFound => Ok(()),
    }
}

fn page_response(status: StatusCode, body: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(body.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    resp
}

/// Bind an upgraded socket to a room as a client actor
///
/// Registers the client, spawns the writer, and runs the reader until the
/// connection winds down.
pub async fn attach_client(
    ws: WebSocketStream<TcpStream>,
    room: RoomHandle,
    nickname: String,
) -> Result<(), AppError> {
    let id = ClientId::new();
    info!(client = %id, nick = %nickname, room = %room.name, "client attached");

    let (sink, stream) = ws.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
    let (kick_tx, kick_rx) = mpsc::channel(1);
    let (binding_tx, binding_rx) = watch::channel(Binding {
        room: room.clone(),
        nickname: nickname.clone(),
    });
    let handle = ClientHandle {
        id,
        nickname,
        outbound: outbound_tx,
        kick: kick_tx,
        binding: binding_tx,
    };
    room.register
        .send(handle)
        .await
        .map_err(|_| AppError::ChannelSend)?;

    tokio::spawn(client::write_socket(sink, outbound_rx, kick_rx, id));
    client::read_socket(stream, id, binding_rx).await;

    info!(client = %id, "client detached");
    Ok(())
}

/// Bring up the parent side of a federation link
///
/// We respond with our hello first, then read the child's, then spawn the
/// link tasks and register the child with the router.
async fn accept_peer(
    mut ws: WebSocketStream<TcpStream>,
    url_id: NodeId,
    url_name: String,
    node: mpsc::Sender<NodeCommand>,
) -> Result<(), AppError> {
    debug!(child = %url_name, id = %url_id, "child connecting");

    let (tx, rx) = oneshot::channel();
    node.send(NodeCommand::Hello { reply: tx })
        .await
        .map_err(|_| AppError::ChannelSend)?;
    let our_hello = rx.await.map_err(|_| AppError::ChannelSend)?;

    // the parent responds first
    let json = serde_json::to_string(&our_hello)?;
    ws.send(WsMessage::Text(json)).await?;
    // then the child responds
    let child_hello = peer::read_hello(&mut ws).await?;

    info!(child = %child_hello.name, id = %child_hello.uuid, "child link up");
    let outbound = peer::spawn_link(ws, child_hello.uuid, child_hello.name.clone(), node.clone());
    node.send(NodeCommand::AddChild {
        link: PeerLink {
            id: child_hello.uuid,
            name: child_hello.name,
            outbound,
            rooms: child_hello.available_rooms,
        },
    })
    .await
    .map_err(|_| AppError::ChannelSend)?;
    Ok(())
}
