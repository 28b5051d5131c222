//! Error types for the chat node
//!
//! Defines application-level errors and slash-command errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// Covers fatal connection faults (terminate the affected actor) and
/// handshake problems. None of these are fatal to the process.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (terminates the connection)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send error (internal channel broken)
    #[error("Channel send error")]
    ChannelSend,

    /// A socket write did not complete within the write deadline
    #[error("Write deadline exceeded")]
    WriteTimeout,

    /// Federation handshake did not complete
    #[error("Peer handshake failed: {0}")]
    Handshake(String),
}

/// A slash command that could not be completed
///
/// Delivered back to the caller as a DM; the room keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Command {name} failed: {reason}")]
pub struct CommandError {
    /// The command the caller invoked
    pub name: String,
    /// Human-readable explanation
    pub reason: String,
}

impl CommandError {
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
