//! Federated WebSocket Chat Node Library
//!
//! A room-based chat server built with tokio-tungstenite using the Actor
//! pattern for state management, with optional parent/child federation
//! between nodes.
//!
//! # Features
//! - WebSocket connection handling
//! - Named rooms created on demand
//! - Slash-command control plane (make/join/exit/listusers/whisper/…)
//! - Deterministic DM rooms for pairs of nicknames
//! - Parent/child federation with per-node message routing
//! - Slow-consumer eviction: a stuck client never slows its room
//!
//! # Architecture
//! Every piece of mutable state is owned by exactly one task and reached
//! only through `mpsc` channels — no locks anywhere:
//! - One room actor per room owns its membership and serializes joins,
//!   leaves, broadcasts, switches, and commands
//! - A reader/writer task pair per client bridges the socket to its room
//! - A reader/writer task pair per federation peer bridges the link to
//!   the node router
//! - One router actor per node owns the room/user directories and decides,
//!   for every message, whether it belongs to a local room, a child
//!   subtree, or the parent
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use chatnode::{handle_connection, Node, NodeId};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (node, node_tx) = Node::new(NodeId::new(), "hub".to_string());
//!     tokio::spawn(node.run());
//!
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     while let Ok((stream, _)) = listener.accept().await {
//!         let node_tx = node_tx.clone();
//!         tokio::spawn(handle_connection(stream, node_tx));
//!     }
//! }
//! ```

pub mod client;
pub mod command;
pub mod error;
pub mod handler;
pub mod message;
pub mod peer;
pub mod room;
pub mod router;
pub mod types;

// Re-export main types for convenience
pub use client::{Binding, ClientHandle, Outbound};
pub use error::{AppError, CommandError};
pub use handler::handle_connection;
pub use message::{CalledCommand, Message};
pub use peer::{connect_to_parent, PeerHello, RoomAd};
pub use room::{Room, RoomHandle, RoomSwitch};
pub use router::{Node, NodeCommand, PeerLink};
pub use types::{ClientId, NodeId, RoomId};
