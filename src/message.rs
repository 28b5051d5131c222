//! Message protocol definitions
//!
//! The wire-level record every actor exchanges, and the parsing of slash
//! commands out of message content. Records travel as JSON inside WebSocket
//! text frames; a frame may carry several records separated by a single
//! newline byte.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::ClientId;

/// A chat message, immutable after creation
///
/// Produced by clients, by peers, and by rooms themselves (server-originated
/// announcements). Field names are pinned to the wire format peers agree on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Identity of the sender (a client id, or the room id for
    /// server-originated messages)
    #[serde(rename = "Uuid")]
    pub uuid: Uuid,
    /// Display name of the sender
    #[serde(rename = "FromNick")]
    pub from_nick: String,
    /// The actual message text
    #[serde(rename = "Content")]
    pub content: String,
    /// Wall-clock send time, RFC-3339 on the wire
    #[serde(rename = "SentTime")]
    pub sent_time: DateTime<Utc>,
    /// Name of the room (or server) this message is addressed to
    #[serde(rename = "ServerName")]
    pub server_name: String,
    /// Whether this message bypassed broadcast as a DM
    #[serde(rename = "IsDirectMessage")]
    pub is_direct_message: bool,
}

impl Message {
    /// Build a client-originated message stamped with the current time
    pub fn new(
        uuid: Uuid,
        from_nick: impl Into<String>,
        content: impl Into<String>,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            uuid,
            from_nick: from_nick.into(),
            content: content.into(),
            sent_time: Utc::now(),
            server_name: server_name.into(),
            is_direct_message: false,
        }
    }

    /// A message is a command iff its content begins with `/`
    pub fn is_command(&self) -> bool {
        self.content.starts_with('/')
    }

    /// Split the content into a command name and a single argument string
    ///
    /// Splits once on the first space; everything after it is the raw
    /// argument string handed to the handler.
    pub fn to_command(&self) -> CalledCommand {
        let mut pieces = self.content.splitn(2, ' ');
        let name = pieces
            .next()
            .unwrap_or("")
            .trim_start_matches('/')
            .to_string();
        let args = pieces.next().unwrap_or("").to_string();
        CalledCommand {
            caller: ClientId(self.uuid),
            name,
            args,
        }
    }

    /// Encode this record as a JSON string
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Encode a burst of records into one frame body, newline-separated
    pub fn encode_batch(messages: &[Message]) -> Result<String, serde_json::Error> {
        let mut body = String::new();
        for (i, msg) in messages.iter().enumerate() {
            if i > 0 {
                body.push('\n');
            }
            body.push_str(&msg.encode()?);
        }
        Ok(body)
    }
}

/// A command parsed out of a client message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalledCommand {
    /// The client running the command
    pub caller: ClientId,
    /// The command name, without the leading slash
    pub name: String,
    /// The raw argument string (may be empty)
    pub args: String,
}
