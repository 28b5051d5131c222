//! Room actor
//!
//! A single long-running task owns each room: its membership map is
//! mutated by no one else, which is the serialization point for joins,
//! leaves, broadcasts, switches, and slash commands. The inbox is four
//! channels (register / unregister / broadcast / switch) consumed by one
//! `select!` loop, one event at a time.
//!
//! Fan-out to members is non-blocking: a member whose outbound queue
//! refuses a send is evicted on the spot, so a slow client never slows
//! the room.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::{self, Binding, ClientHandle, Outbound};
use crate::command::{self, CommandSpec};
use crate::error::CommandError;
use crate::message::Message;
use crate::router::{Caller, NodeCommand};
use crate::types::{ClientId, RoomId};

/// Capacity of the register / unregister / switch inboxes
const CONTROL_CHANNEL_SIZE: usize = 32;

/// Capacity of the broadcast inbox
const BROADCAST_CHANNEL_SIZE: usize = 256;

/// Cloneable address of a room actor
#[derive(Debug, Clone)]
pub struct RoomHandle {
    pub id: RoomId,
    pub name: String,
    pub register: mpsc::Sender<ClientHandle>,
    pub unregister: mpsc::Sender<ClientId>,
    pub broadcast: mpsc::Sender<Message>,
    pub switch: mpsc::Sender<RoomSwitch>,
}

/// Request to move a client from this room into `target`
///
/// The client's outbound queue survives the move; only the room binding
/// changes.
#[derive(Debug)]
pub struct RoomSwitch {
    pub client: ClientId,
    pub target: RoomHandle,
}

/// A registered member, from the room's point of view
#[derive(Debug)]
struct Member {
    handle: ClientHandle,
    present: bool,
}

/// The room actor: owns membership, serializes all mutations
pub struct Room {
    id: RoomId,
    name: String,
    members: HashMap<ClientId, Member>,
    register_rx: mpsc::Receiver<ClientHandle>,
    unregister_rx: mpsc::Receiver<ClientId>,
    broadcast_rx: mpsc::Receiver<Message>,
    switch_rx: mpsc::Receiver<RoomSwitch>,
    handle: RoomHandle,
    node: mpsc::Sender<NodeCommand>,
    commands: &'static [CommandSpec],
}

impl Room {
    /// Create a room actor, spawn its event loop, and return its handle
    ///
    /// The loop runs until the process exits (or every handle is dropped).
    pub fn spawn(name: String, node: mpsc::Sender<NodeCommand>) -> RoomHandle {
        let id = RoomId::new();
        let (register_tx, register_rx) = mpsc::channel(CONTROL_CHANNEL_SIZE);
        let (unregister_tx, unregister_rx) = mpsc::channel(CONTROL_CHANNEL_SIZE);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_CHANNEL_SIZE);
        let (switch_tx, switch_rx) = mpsc::channel(CONTROL_CHANNEL_SIZE);
        let handle = RoomHandle {
            id,
            name: name.clone(),
            register: register_tx,
            unregister: unregister_tx,
            broadcast: broadcast_tx,
            switch: switch_tx,
        };
        let room = Room {
            id,
            name,
            members: HashMap::new(),
            register_rx,
            unregister_rx,
            broadcast_rx,
            switch_rx,
            handle: handle.clone(),
            node,
            commands: command::COMMANDS,
        };
        tokio::spawn(room.run());
        handle
    }

    /// Run the room event loop
    ///
    /// Processes one event at a time; the handlers below are the only code
    /// that touches the membership map.
    async fn run(mut self) {
        info!(room = %self.name, "room started");
        loop {
            tokio::select! {
                Some(client) = self.register_rx.recv() => self.handle_register(client),
                Some(id) = self.unregister_rx.recv() => self.handle_unregister(id),
                Some(msg) = self.broadcast_rx.recv() => self.handle_broadcast(msg),
                Some(switch) = self.switch_rx.recv() => self.handle_switch(switch),
                else => break,
            }
        }
        info!(room = %self.name, "room stopped");
    }

    /// Add a client, renaming on nickname collision, and announce the join
    fn handle_register(&mut self, mut client: ClientHandle) {
        let nickname = self.unique_nickname(client.nickname);
        client.nickname = nickname.clone();
        debug!(room = %self.name, client = %client.id, nick = %nickname, "register");

        // publish the (possibly renamed) binding to the reader task
        let _ = client.binding.send(Binding {
            room: self.handle.clone(),
            nickname: nickname.clone(),
        });

        let _ = self.node.try_send(NodeCommand::SetPresence {
            id: client.id,
            nickname: nickname.clone(),
            online: true,
            dm: client.outbound.downgrade(),
        });

        self.members.insert(client.id, Member { handle: client, present: true });
        self.announce(format!("---- {} joined {} ----", nickname, self.name));
    }

    /// Remove a client and close their queue; a no-op if they already left
    fn handle_unregister(&mut self, id: ClientId) {
        let Some(member) = self.members.remove(&id) else {
            return;
        };
        let nickname = member.handle.nickname.clone();
        debug!(room = %self.name, client = %id, nick = %nickname, "unregister");

        let _ = self.node.try_send(NodeCommand::SetPresence {
            id,
            nickname: nickname.clone(),
            online: false,
            dm: member.handle.outbound.downgrade(),
        });
        self.announce(format!("---- {} left {} (disconnected) ----", nickname, self.name));
        // dropping the member drops the only strong outbound sender,
        // which closes the queue and winds the writer down
    }

    /// Dispatch a command, or fan a message out to every present member
    fn handle_broadcast(&mut self, msg: Message) {
        if msg.is_command() {
            self.run_command(msg);
            return;
        }

        if msg.server_name != self.name {
            // locally produced traffic for a room that lives elsewhere
            if self.node.try_send(NodeCommand::Route(msg)).is_err() {
                warn!(room = %self.name, "node inbox unavailable, dropping message");
            }
            return;
        }

        let mut refused = Vec::new();
        for (id, member) in &self.members {
            if !member.present {
                continue;
            }
            if member
                .handle
                .outbound
                .try_send(Outbound::Record(msg.clone()))
                .is_err()
            {
                refused.push(*id);
            }
        }

        for id in refused {
            if let Some(member) = self.members.remove(&id) {
                warn!(
                    room = %self.name,
                    client = %id,
                    nick = %member.handle.nickname,
                    "evicting slow consumer"
                );
                let _ = self.node.try_send(NodeCommand::SetPresence {
                    id,
                    nickname: member.handle.nickname.clone(),
                    online: false,
                    dm: member.handle.outbound.downgrade(),
                });
            }
        }
    }

    /// Move a member into another room without closing their queue
    fn handle_switch(&mut self, switch: RoomSwitch) {
        let Some(member) = self.members.remove(&switch.client) else {
            return;
        };
        let nickname = member.handle.nickname.clone();
        debug!(room = %self.name, client = %switch.client, target = %switch.target.name, "switch");

        self.announce(format!("---- {} left {} (switched rooms) ----", nickname, self.name));

        let target = switch.target;
        let handle = member.handle;
        tokio::spawn(async move {
            let _ = target.register.send(handle).await;
        });
    }

    /// Echo the raw command back to the caller, run it, DM any error
    fn run_command(&mut self, msg: Message) {
        let called = msg.to_command();
        self.dm_caller(called.caller, &msg.content);

        let result = match command::find(&called.name) {
            Some(spec) => (spec.run)(self, called.caller, &called.args),
            None => Err(CommandError::new(
                called.name.clone(),
                format!("Command `{}` does not exist", called.name),
            )),
        };
        if let Err(err) = result {
            self.dm_caller(called.caller, &err.to_string());
        }
    }

    /// Enqueue a server-originated announcement on our own broadcast inbox
    ///
    /// Done from a throwaway task so the actor never blocks on itself; the
    /// announcement is ordered after the membership change that caused it.
    fn announce(&self, text: String) {
        let msg = self.server_message(&text);
        let tx = self.handle.broadcast.clone();
        tokio::spawn(async move {
            let _ = tx.send(msg).await;
        });
    }

    /// Build a message originating from the room itself
    pub(crate) fn server_message(&self, content: &str) -> Message {
        Message {
            uuid: self.id.0,
            from_nick: self.name.clone(),
            content: content.to_string(),
            sent_time: Utc::now(),
            server_name: self.name.clone(),
            is_direct_message: false,
        }
    }

    /// DM a line to a member of this room, bypassing broadcast
    pub(crate) fn dm_caller(&self, id: ClientId, content: &str) {
        if let Some(member) = self.members.get(&id) {
            let dm = client::server_dm(self.server_message(content));
            let _ = member.handle.outbound.try_send(dm);
        }
    }

    /// The capability handed to the node router so it can DM replies back
    pub(crate) fn caller_capability(&self, id: ClientId) -> Option<Caller> {
        self.members.get(&id).map(|member| Caller {
            id,
            nickname: member.handle.nickname.clone(),
            room_id: self.id,
            room_name: self.name.clone(),
            outbound: member.handle.outbound.clone(),
        })
    }

    fn nickname_taken(&self, nick: &str) -> bool {
        self.members
            .values()
            .any(|m| m.present && m.handle.nickname == nick)
    }

    /// Resolve a nickname collision by appending a suffix seeded from the
    /// clock and the member count, probing until free
    fn unique_nickname(&self, proposed: String) -> String {
        if !self.nickname_taken(&proposed) {
            return proposed;
        }
        let mut n = (Utc::now().timestamp() as u64) % (self.members.len() as u64 + 1);
        loop {
            let candidate = format!("{}_{}", proposed, n);
            if !self.nickname_taken(&candidate) {
                info!(room = %self.name, nick = %proposed, renamed = %candidate, "nickname collision");
                return candidate;
            }
            n += 1;
        }
    }

    // ---- command handlers -------------------------------------------------
    //
    // Invoked from run_command inside the event loop, so they read and
    // mutate membership directly. Handlers that need the node directories
    // delegate to the router with a caller capability and never await it.

    /// `/make <roomName>` — create a room in the node directory
    pub(crate) fn cmd_make(&mut self, caller: ClientId, args: &str) -> Result<(), CommandError> {
        let name = command::single_arg("make", "room name", args)?;
        if let Some(reply_to) = self.caller_capability(caller) {
            let _ = self.node.try_send(NodeCommand::MakeRoom { name, reply_to });
        }
        Ok(())
    }

    /// `/listrooms` — DM a table of every room on the node
    pub(crate) fn cmd_listrooms(&mut self, caller: ClientId, _args: &str) -> Result<(), CommandError> {
        if let Some(reply_to) = self.caller_capability(caller) {
            let _ = self.node.try_send(NodeCommand::ListRooms { reply_to });
        }
        Ok(())
    }

    /// `/join <roomName>` — ask the router to initiate a room switch
    pub(crate) fn cmd_join(&mut self, caller: ClientId, args: &str) -> Result<(), CommandError> {
        let name = command::single_arg("join", "room name", args)?;
        if let Some(reply_to) = self.caller_capability(caller) {
            let _ = self.node.try_send(NodeCommand::JoinRoom {
                name,
                reply_to,
                from: self.handle.switch.clone(),
            });
        }
        Ok(())
    }

    /// `/exit` — unregister and kick the caller
    pub(crate) fn cmd_exit(&mut self, caller: ClientId, _args: &str) -> Result<(), CommandError> {
        if let Some(member) = self.members.get(&caller) {
            let _ = member.handle.kick.try_send(());
        }
        self.handle_unregister(caller);
        Ok(())
    }

    /// `/listusers` — DM the members of this room, marking the caller
    pub(crate) fn cmd_listusers(&mut self, caller: ClientId, _args: &str) -> Result<(), CommandError> {
        let mut listing = String::from("\nUsers:\n---------\n");
        for member in self.members.values() {
            if !member.present {
                continue;
            }
            listing.push_str(&member.handle.nickname);
            if member.handle.id == caller {
                listing.push_str(" (* you)");
            }
            listing.push('\n');
        }
        self.dm_caller(caller, &listing);
        Ok(())
    }

    /// `/listallusers` — DM the global presence table
    pub(crate) fn cmd_listallusers(&mut self, caller: ClientId, _args: &str) -> Result<(), CommandError> {
        if let Some(reply_to) = self.caller_capability(caller) {
            let _ = self.node.try_send(NodeCommand::ListAllUsers { reply_to });
        }
        Ok(())
    }

    /// `/help [name]` — list commands, or DM one command's help string
    pub(crate) fn cmd_help(&mut self, caller: ClientId, args: &str) -> Result<(), CommandError> {
        let topic = args.trim();
        if topic.is_empty() {
            let mut listing = String::from("\nAvailable Commands:\n-------------------\n");
            for spec in self.commands {
                listing.push_str(spec.name);
                listing.push('\n');
            }
            self.dm_caller(caller, &listing);
            return Ok(());
        }
        match command::find(topic) {
            Some(spec) => {
                self.dm_caller(caller, spec.help);
                Ok(())
            }
            None => Err(CommandError::new(
                "help",
                format!("Command `{}` does not exist", topic),
            )),
        }
    }

    /// `/whisper <nick> <msg>` — DM another user anywhere on the node
    pub(crate) fn cmd_whisper(&mut self, caller: ClientId, args: &str) -> Result<(), CommandError> {
        let mut pieces = args.splitn(2, ' ');
        let target = pieces.next().unwrap_or("").trim().to_string();
        let contents = pieces.next().unwrap_or("").to_string();
        if target.is_empty() || contents.is_empty() {
            let got = if target.is_empty() { 0 } else { 1 };
            return Err(CommandError::new(
                "whisper",
                format!("Wrong number of arguments: want 2 (nickname, contents), got {} args", got),
            ));
        }
        let Some(reply_to) = self.caller_capability(caller) else {
            return Ok(());
        };
        let message = Message {
            uuid: caller.0,
            from_nick: reply_to.nickname.clone(),
            content: contents,
            sent_time: Utc::now(),
            server_name: self.name.clone(),
            is_direct_message: true,
        };
        let _ = self.node.try_send(NodeCommand::Whisper {
            target,
            message,
            reply_to,
        });
        Ok(())
    }
}
