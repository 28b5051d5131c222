//! Node router actor
//!
//! One task per node arbitrates every routed message: a local room hit
//! feeds the room's broadcast inbox, otherwise a child advertising the
//! room gets it, otherwise it escalates to the parent, otherwise it is
//! dropped. The node directories (`LocalRooms`, the name index, the
//! `AllUsers` presence table, the peer tables) are this actor's private
//! state; rooms and the ingress reach them only through its inbox.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::client::{self, Outbound};
use crate::error::CommandError;
use crate::message::Message;
use crate::peer::{PeerHello, RoomAd};
use crate::room::{Room, RoomHandle, RoomSwitch};
use crate::types::{ClientId, NodeId, RoomId};

/// Channel buffer size for node commands
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Capability for DMing a reply back to a command's caller
///
/// Carries a transient clone of the caller's outbound sender; dropped as
/// soon as the reply is delivered.
#[derive(Debug, Clone)]
pub struct Caller {
    pub id: ClientId,
    pub nickname: String,
    pub room_id: RoomId,
    pub room_name: String,
    pub outbound: mpsc::Sender<Outbound>,
}

/// A live federation link, as the router sees it
#[derive(Debug)]
pub struct PeerLink {
    pub id: NodeId,
    pub name: String,
    pub outbound: mpsc::Sender<Message>,
    /// Rooms the remote side advertised at handshake
    pub rooms: Vec<RoomAd>,
}

impl PeerLink {
    fn advertises(&self, room_name: &str) -> bool {
        self.rooms.iter().any(|ad| ad.name == room_name)
    }
}

/// Commands sent to the node router actor
#[derive(Debug)]
pub enum NodeCommand {
    /// Arbitrate a message: local room, child subtree, or parent
    Route(Message),
    /// Get-or-create a named room (ingress, initial room)
    OpenRoom {
        name: String,
        reply: oneshot::Sender<RoomHandle>,
    },
    /// Get-or-create the DM room for a pair of nicknames; both orderings
    /// of the pair alias the same room
    OpenDmRoom {
        source: String,
        target: String,
        reply: oneshot::Sender<RoomHandle>,
    },
    /// `/make`: create a room and DM a confirmation
    MakeRoom { name: String, reply_to: Caller },
    /// `/listrooms`: DM the room table
    ListRooms { reply_to: Caller },
    /// `/listallusers`: DM the global presence table
    ListAllUsers { reply_to: Caller },
    /// `/whisper`: deliver a DM by nickname, or DM the failure back
    Whisper {
        target: String,
        message: Message,
        reply_to: Caller,
    },
    /// `/join`: look the room up and initiate the switch from the
    /// caller's current room
    JoinRoom {
        name: String,
        reply_to: Caller,
        from: mpsc::Sender<RoomSwitch>,
    },
    /// Presence upsert from a room's register/unregister path
    SetPresence {
        id: ClientId,
        nickname: String,
        online: bool,
        dm: mpsc::WeakSender<Outbound>,
    },
    /// Compose this node's handshake record
    Hello { reply: oneshot::Sender<PeerHello> },
    /// A child link completed its handshake
    AddChild { link: PeerLink },
    /// The parent link completed its handshake
    SetParent { link: PeerLink },
    /// A federation link died
    PeerClosed { id: NodeId },
}

/// A user known to the node; lingers (offline) after disconnect
#[derive(Debug)]
struct UserEntry {
    nickname: String,
    online: bool,
    /// Non-owning capability to the user's outbound queue; never keeps a
    /// dead client's queue open
    dm: mpsc::WeakSender<Outbound>,
}

/// The node router actor
pub struct Node {
    id: NodeId,
    name: String,
    local_rooms: HashMap<RoomId, RoomHandle>,
    name_index: HashMap<String, RoomId>,
    all_users: HashMap<ClientId, UserEntry>,
    children: HashMap<NodeId, PeerLink>,
    parent: Option<PeerLink>,
    receiver: mpsc::Receiver<NodeCommand>,
    /// Our own inbox address, handed to rooms at spawn
    handle: mpsc::Sender<NodeCommand>,
}

impl Node {
    /// Create the router actor; the returned sender is the node's inbox
    pub fn new(id: NodeId, name: String) -> (Self, mpsc::Sender<NodeCommand>) {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let node = Self {
            id,
            name,
            local_rooms: HashMap::new(),
            name_index: HashMap::new(),
            all_users: HashMap::new(),
            children: HashMap::new(),
            parent: None,
            receiver: rx,
            handle: tx.clone(),
        };
        (node, tx)
    }

    /// Run the router event loop
    pub async fn run(mut self) {
        info!(node = %self.name, id = %self.id, "node router started");
        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd).await;
        }
        info!(node = %self.name, "node router shutting down");
    }

    async fn handle_command(&mut self, cmd: NodeCommand) {
        match cmd {
            NodeCommand::Route(msg) => self.handle_route(msg).await,
            NodeCommand::OpenRoom { name, reply } => {
                let room = self.open_room(&name);
                let _ = reply.send(room);
            }
            NodeCommand::OpenDmRoom { source, target, reply } => {
                let room = self.open_dm_room(&source, &target);
                let _ = reply.send(room);
            }
            NodeCommand::MakeRoom { name, reply_to } => self.handle_make_room(name, reply_to),
            NodeCommand::ListRooms { reply_to } => self.handle_list_rooms(reply_to),
            NodeCommand::ListAllUsers { reply_to } => self.handle_list_all_users(reply_to),
            NodeCommand::Whisper { target, message, reply_to } => {
                self.handle_whisper(target, message, reply_to)
            }
            NodeCommand::JoinRoom { name, reply_to, from } => {
                self.handle_join_room(name, reply_to, from)
            }
            NodeCommand::SetPresence { id, nickname, online, dm } => {
                self.all_users.insert(id, UserEntry { nickname, online, dm });
            }
            NodeCommand::Hello { reply } => {
                let _ = reply.send(PeerHello {
                    name: self.name.clone(),
                    uuid: self.id,
                    available_rooms: self.room_ads(),
                });
            }
            NodeCommand::AddChild { link } => {
                info!(node = %self.name, child = %link.name, id = %link.id, "child link registered");
                self.children.insert(link.id, link);
            }
            NodeCommand::SetParent { link } => {
                info!(node = %self.name, parent = %link.name, id = %link.id, "parent link registered");
                self.parent = Some(link);
            }
            NodeCommand::PeerClosed { id } => self.handle_peer_closed(id),
        }
    }

    /// Pick the next destination: local room, child subtree, or parent
    async fn handle_route(&mut self, msg: Message) {
        if let Some(room) = self.room_by_name(&msg.server_name) {
            // rooms never block (their handlers are non-async), so an
            // awaited send here cannot deadlock the node
            let _ = room.broadcast.send(msg).await;
            return;
        }

        if let Some(child) = self.children.values().find(|c| c.advertises(&msg.server_name)) {
            if child.outbound.try_send(msg).is_err() {
                warn!(node = %self.name, child = %child.name, "child outbound refused, dropping message");
            }
            return;
        }

        match &self.parent {
            Some(parent) => {
                if parent.outbound.try_send(msg).is_err() {
                    warn!(node = %self.name, parent = %parent.name, "parent outbound refused, dropping message");
                }
            }
            None => {
                debug!(node = %self.name, room = %msg.server_name, "no route for message, dropping");
            }
        }
    }

    fn room_by_name(&self, name: &str) -> Option<RoomHandle> {
        self.name_index
            .get(name)
            .and_then(|id| self.local_rooms.get(id))
            .cloned()
    }

    /// Get-or-create a named room and index it
    fn open_room(&mut self, name: &str) -> RoomHandle {
        if let Some(room) = self.room_by_name(name) {
            return room;
        }
        let room = Room::spawn(name.to_string(), self.handle.clone());
        info!(node = %self.name, room = %name, id = %room.id, "created room");
        self.name_index.insert(name.to_string(), room.id);
        self.local_rooms.insert(room.id, room.clone());
        room
    }

    /// Get-or-create the DM room for an ordered pair of nicknames
    ///
    /// The room is named `<target>-<source>`; both orderings are indexed
    /// as aliases of the same room, so either endpoint reaches it.
    fn open_dm_room(&mut self, source: &str, target: &str) -> RoomHandle {
        let srctar = format!("{}-{}", source, target);
        let tarsrc = format!("{}-{}", target, source);

        let existing = self
            .name_index
            .get(&tarsrc)
            .or_else(|| self.name_index.get(&srctar))
            .copied();
        if let Some(id) = existing {
            if let Some(room) = self.local_rooms.get(&id).cloned() {
                self.name_index.insert(srctar, id);
                self.name_index.insert(tarsrc, id);
                return room;
            }
        }

        let room = self.open_room(&tarsrc);
        self.name_index.insert(srctar, room.id);
        room
    }

    fn handle_make_room(&mut self, name: String, reply_to: Caller) {
        self.open_room(&name);
        self.dm(&reply_to, &format!("Successfully made new room `{}`", name));
        debug!(node = %self.name, caller = %reply_to.nickname, room = %name, "made new room");
    }

    fn handle_list_rooms(&self, reply_to: Caller) {
        let mut listing = String::from("\nChannels:\n---------\n");
        for (id, room) in &self.local_rooms {
            listing.push_str(&room.name);
            if *id == reply_to.room_id {
                listing.push_str(" (* joined)");
            }
            listing.push('\n');
        }
        self.dm(&reply_to, &listing);
    }

    fn handle_list_all_users(&self, reply_to: Caller) {
        let mut listing = String::from("\nAll Users:\n---------\n");
        for (id, user) in &self.all_users {
            if !user.online {
                continue;
            }
            listing.push_str(&user.nickname);
            if *id == reply_to.id {
                listing.push_str(" (* you)");
            }
            listing.push('\n');
        }
        self.dm(&reply_to, &listing);
    }

    fn handle_whisper(&self, target: String, message: Message, reply_to: Caller) {
        let recipient = self
            .all_users
            .values()
            .find(|u| u.online && u.nickname == target)
            .and_then(|u| u.dm.upgrade());
        match recipient {
            Some(outbound) => {
                let _ = outbound.try_send(client::client_dm(&target, message));
            }
            None => {
                self.dm_error(
                    &reply_to,
                    &CommandError::new(
                        "whisper",
                        format!("Target client {} does not exist, or is offline", target),
                    ),
                );
            }
        }
    }

    fn handle_join_room(&mut self, name: String, reply_to: Caller, from: mpsc::Sender<RoomSwitch>) {
        let Some(room) = self.room_by_name(&name) else {
            self.dm_error(
                &reply_to,
                &CommandError::new("join", format!("Room `{}` does not exist", name)),
            );
            return;
        };
        // UI retitle frame first, then the switch; queue order keeps
        // rename → new-room announcements → messages on the wire
        let _ = reply_to.outbound.try_send(Outbound::RoomName(room.name.clone()));
        let switch = RoomSwitch { client: reply_to.id, target: room };
        tokio::spawn(async move {
            let _ = from.send(switch).await;
        });
    }

    fn handle_peer_closed(&mut self, id: NodeId) {
        if let Some(link) = self.children.remove(&id) {
            info!(node = %self.name, child = %link.name, "child link closed");
            return;
        }
        if self.parent.as_ref().is_some_and(|p| p.id == id) {
            let link = self.parent.take();
            info!(node = %self.name, parent = %link.map(|l| l.name).unwrap_or_default(), "parent link closed");
        }
    }

    fn room_ads(&self) -> Vec<RoomAd> {
        self.local_rooms
            .values()
            .map(|room| RoomAd { uuid: room.id, name: room.name.clone() })
            .collect()
    }

    /// DM a server-originated line back to a command's caller
    fn dm(&self, to: &Caller, content: &str) {
        let msg = Message {
            uuid: to.room_id.0,
            from_nick: to.room_name.clone(),
            content: content.to_string(),
            sent_time: Utc::now(),
            server_name: to.room_name.clone(),
            is_direct_message: false,
        };
        let _ = to.outbound.try_send(client::server_dm(msg));
    }

    fn dm_error(&self, to: &Caller, err: &CommandError) {
        self.dm(to, &err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use uuid::Uuid;

    fn spawn_node(name: &str) -> mpsc::Sender<NodeCommand> {
        let (node, tx) = Node::new(NodeId::new(), name.to_string());
        tokio::spawn(node.run());
        tx
    }

    async fn open_room(node: &mpsc::Sender<NodeCommand>, name: &str) -> RoomHandle {
        let (tx, rx) = oneshot::channel();
        node.send(NodeCommand::OpenRoom { name: name.to_string(), reply: tx })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    fn caller(room: &RoomHandle) -> (Caller, mpsc::Receiver<Outbound>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let caller = Caller {
            id: ClientId::new(),
            nickname: "alice".to_string(),
            room_id: room.id,
            room_name: room.name.clone(),
            outbound: outbound_tx,
        };
        (caller, outbound_rx)
    }

    async fn recv_dm(rx: &mut mpsc::Receiver<Outbound>) -> Message {
        let item = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for DM")
            .expect("queue closed");
        match item {
            Outbound::Record(msg) => msg,
            Outbound::RoomName(name) => panic!("unexpected retitle frame `{}`", name),
        }
    }

    fn routed(room_name: &str, content: &str) -> Message {
        Message::new(Uuid::new_v4(), "someone", content, room_name)
    }

    #[tokio::test]
    async fn test_route_prefers_local_room() {
        let node = spawn_node("hub");
        let room = open_room(&node, "x").await;

        // a child also advertises `x`; the local room must win
        let (child_tx, mut child_rx) = mpsc::channel(16);
        node.send(NodeCommand::AddChild {
            link: PeerLink {
                id: NodeId::new(),
                name: "leaf".to_string(),
                outbound: child_tx,
                rooms: vec![RoomAd { uuid: RoomId::new(), name: "x".to_string() }],
            },
        })
        .await
        .unwrap();

        // observe the local room's inbox through a registered member
        let (member_tx, mut member_rx) = mpsc::channel(16);
        let (kick_tx, _kick_rx) = mpsc::channel(1);
        let (binding_tx, _binding_rx) = tokio::sync::watch::channel(crate::client::Binding {
            room: room.clone(),
            nickname: "watcher".to_string(),
        });
        room.register
            .send(crate::client::ClientHandle {
                id: ClientId::new(),
                nickname: "watcher".to_string(),
                outbound: member_tx,
                kick: kick_tx,
                binding: binding_tx,
            })
            .await
            .unwrap();

        // the watcher's registration is processed once its join
        // announcement comes back
        loop {
            let item = timeout(Duration::from_secs(1), member_rx.recv())
                .await
                .expect("registration never processed")
                .expect("queue closed");
            if let Outbound::Record(msg) = item {
                if msg.content.contains("watcher joined") {
                    break;
                }
            }
        }

        node.send(NodeCommand::Route(routed("x", "hello"))).await.unwrap();

        loop {
            let item = timeout(Duration::from_secs(1), member_rx.recv())
                .await
                .expect("local room never saw the message")
                .expect("queue closed");
            if let Outbound::Record(msg) = item {
                if msg.content == "hello" {
                    break;
                }
            }
        }
        assert!(child_rx.try_recv().is_err(), "child must not receive a local hit");
    }

    #[tokio::test]
    async fn test_route_child_hit_then_parent_escalation() {
        let node = spawn_node("hub");

        let (child_tx, mut child_rx) = mpsc::channel(16);
        node.send(NodeCommand::AddChild {
            link: PeerLink {
                id: NodeId::new(),
                name: "leaf".to_string(),
                outbound: child_tx,
                rooms: vec![RoomAd { uuid: RoomId::new(), name: "x".to_string() }],
            },
        })
        .await
        .unwrap();

        let (parent_tx, mut parent_rx) = mpsc::channel(16);
        node.send(NodeCommand::SetParent {
            link: PeerLink {
                id: NodeId::new(),
                name: "root".to_string(),
                outbound: parent_tx,
                rooms: vec![],
            },
        })
        .await
        .unwrap();

        node.send(NodeCommand::Route(routed("x", "to child"))).await.unwrap();
        let msg = timeout(Duration::from_secs(1), child_rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.content, "to child");

        node.send(NodeCommand::Route(routed("y", "upward"))).await.unwrap();
        let msg = timeout(Duration::from_secs(1), parent_rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.content, "upward");
        assert!(child_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_route_without_any_hit_drops() {
        let node = spawn_node("lonely");
        node.send(NodeCommand::Route(routed("nowhere", "lost"))).await.unwrap();
        // the router survives the drop and keeps serving
        let room = open_room(&node, "alive").await;
        assert_eq!(room.name, "alive");
    }

    #[tokio::test]
    async fn test_dm_room_aliases_are_one_room() {
        let node = spawn_node("hub");
        let (tx, rx) = oneshot::channel();
        node.send(NodeCommand::OpenDmRoom {
            source: "alice".to_string(),
            target: "bob".to_string(),
            reply: tx,
        })
        .await
        .unwrap();
        let first = rx.await.unwrap();

        let (tx, rx) = oneshot::channel();
        node.send(NodeCommand::OpenDmRoom {
            source: "bob".to_string(),
            target: "alice".to_string(),
            reply: tx,
        })
        .await
        .unwrap();
        let second = rx.await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.name, "bob-alice");
    }

    #[tokio::test]
    async fn test_make_room_confirms_and_listrooms_marks() {
        let node = spawn_node("hub");
        let main = open_room(&node, "main").await;
        let (who, mut dm_rx) = caller(&main);

        node.send(NodeCommand::MakeRoom { name: "lounge".to_string(), reply_to: who.clone() })
            .await
            .unwrap();
        let confirm = recv_dm(&mut dm_rx).await;
        assert_eq!(confirm.content, "(DM) Successfully made new room `lounge`");
        assert!(confirm.is_direct_message);

        node.send(NodeCommand::ListRooms { reply_to: who }).await.unwrap();
        let listing = recv_dm(&mut dm_rx).await;
        assert!(listing.content.contains("\nChannels:\n---------\n"));
        assert!(listing.content.contains("main (* joined)"));
        assert!(listing.content.contains("lounge\n"));
        assert!(!listing.content.contains("lounge (* joined)"));
    }

    #[tokio::test]
    async fn test_join_missing_room_errors() {
        let node = spawn_node("hub");
        let main = open_room(&node, "main").await;
        let (who, mut dm_rx) = caller(&main);
        let (switch_tx, mut switch_rx) = mpsc::channel(4);

        node.send(NodeCommand::JoinRoom {
            name: "nowhere".to_string(),
            reply_to: who,
            from: switch_tx,
        })
        .await
        .unwrap();

        let err = recv_dm(&mut dm_rx).await;
        assert_eq!(err.content, "(DM) Command join failed: Room `nowhere` does not exist");
        assert!(timeout(Duration::from_millis(100), switch_rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_join_sends_retitle_then_switch() {
        let node = spawn_node("hub");
        let main = open_room(&node, "main").await;
        let lounge = open_room(&node, "lounge").await;
        let (who, mut dm_rx) = caller(&main);
        let caller_id = who.id;
        let (switch_tx, mut switch_rx) = mpsc::channel(4);

        node.send(NodeCommand::JoinRoom {
            name: "lounge".to_string(),
            reply_to: who,
            from: switch_tx,
        })
        .await
        .unwrap();

        let item = timeout(Duration::from_secs(1), dm_rx.recv()).await.unwrap().unwrap();
        match item {
            Outbound::RoomName(name) => assert_eq!(name, "lounge"),
            Outbound::Record(msg) => panic!("expected retitle before any record, got {:?}", msg.content),
        }
        let switch = timeout(Duration::from_secs(1), switch_rx.recv()).await.unwrap().unwrap();
        assert_eq!(switch.client, caller_id);
        assert_eq!(switch.target.id, lounge.id);
    }

    #[tokio::test]
    async fn test_whisper_delivers_and_reports_offline() {
        let node = spawn_node("hub");
        let main = open_room(&node, "main").await;
        let (who, mut dm_rx) = caller(&main);

        let (bob_tx, mut bob_rx) = mpsc::channel(16);
        node.send(NodeCommand::SetPresence {
            id: ClientId::new(),
            nickname: "bob".to_string(),
            online: true,
            dm: bob_tx.downgrade(),
        })
        .await
        .unwrap();

        let whisper = Message {
            is_direct_message: true,
            ..Message::new(who.id.0, "alice", "psst", "main")
        };
        node.send(NodeCommand::Whisper {
            target: "bob".to_string(),
            message: whisper,
            reply_to: who.clone(),
        })
        .await
        .unwrap();

        let delivered = timeout(Duration::from_secs(1), bob_rx.recv()).await.unwrap().unwrap();
        match delivered {
            Outbound::Record(msg) => {
                assert_eq!(msg.content, "(bob) psst");
                assert!(msg.is_direct_message);
            }
            other => panic!("unexpected outbound item: {:?}", other),
        }

        node.send(NodeCommand::Whisper {
            target: "zed".to_string(),
            message: Message::new(who.id.0, "alice", "hello?", "main"),
            reply_to: who,
        })
        .await
        .unwrap();
        let err = recv_dm(&mut dm_rx).await;
        assert_eq!(
            err.content,
            "(DM) Command whisper failed: Target client zed does not exist, or is offline"
        );
    }

    #[tokio::test]
    async fn test_listallusers_skips_offline() {
        let node = spawn_node("hub");
        let main = open_room(&node, "main").await;
        let (who, mut dm_rx) = caller(&main);

        let (bob_tx, _bob_rx) = mpsc::channel::<Outbound>(4);
        node.send(NodeCommand::SetPresence {
            id: who.id,
            nickname: "alice".to_string(),
            online: true,
            dm: who.outbound.downgrade(),
        })
        .await
        .unwrap();
        let gone = ClientId::new();
        node.send(NodeCommand::SetPresence {
            id: gone,
            nickname: "bob".to_string(),
            online: false,
            dm: bob_tx.downgrade(),
        })
        .await
        .unwrap();

        node.send(NodeCommand::ListAllUsers { reply_to: who }).await.unwrap();
        let listing = recv_dm(&mut dm_rx).await;
        assert!(listing.content.contains("\nAll Users:\n---------\n"));
        assert!(listing.content.contains("alice (* you)"));
        assert!(!listing.content.contains("bob"));
    }

    #[tokio::test]
    async fn test_hello_advertises_local_rooms() {
        let node = spawn_node("hub");
        open_room(&node, "main").await;
        open_room(&node, "lounge").await;

        let (tx, rx) = oneshot::channel();
        node.send(NodeCommand::Hello { reply: tx }).await.unwrap();
        let hello = rx.await.unwrap();
        assert_eq!(hello.name, "hub");
        let mut names: Vec<_> = hello.available_rooms.iter().map(|ad| ad.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, ["lounge", "main"]);
    }
}
