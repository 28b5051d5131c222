//! Slash-command registry
//!
//! A static table mapping each command name to its handler and help
//! string. Handlers run inside the owning room's event loop (see
//! [`crate::room`]), so they read and mutate membership directly; the
//! ones that need the node directories delegate to the router.

use crate::error::CommandError;
use crate::room::Room;
use crate::types::ClientId;

/// Handler signature: `(room, caller, argstring) -> error?`
pub type Handler = fn(&mut Room, ClientId, &str) -> Result<(), CommandError>;

/// One entry in the command table
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub help: &'static str,
    pub run: Handler,
}

/// The built-in commands users can run; these start with a slash
pub static COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "make",
        help: "Usage:\n/make roomName\n    Makes a new room with a given name.",
        run: Room::cmd_make,
    },
    CommandSpec {
        name: "listrooms",
        help: "Usage:\n/listrooms\n    Lists all open rooms.",
        run: Room::cmd_listrooms,
    },
    CommandSpec {
        name: "join",
        help: "Usage:\n/join roomName\n    Moves the client to the given room.",
        run: Room::cmd_join,
    },
    CommandSpec {
        name: "exit",
        help: "Usage:\n/exit\n    Leave the server.",
        run: Room::cmd_exit,
    },
    CommandSpec {
        name: "listusers",
        help: "Usage:\n/listusers\n    List the users in the current room.",
        run: Room::cmd_listusers,
    },
    CommandSpec {
        name: "listallusers",
        help: "Usage:\n/listallusers\n    List all users in the current server.",
        run: Room::cmd_listallusers,
    },
    CommandSpec {
        name: "help",
        help: "Usage:\n/help\n    List all available commands.\n/help command\n    Print out the helpstring for that command.",
        run: Room::cmd_help,
    },
    CommandSpec {
        name: "whisper",
        help: "Usage:\n/whisper nickName message\n    Direct message a user with the given nickname.",
        run: Room::cmd_whisper,
    },
];

/// Look up a command by name (case-sensitive)
pub fn find(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|spec| spec.name == name)
}

/// Parse a command that takes exactly one argument
pub fn single_arg(cmd: &str, what: &str, args: &str) -> Result<String, CommandError> {
    let trimmed = args.trim();
    if trimmed.is_empty() {
        return Err(CommandError::new(
            cmd,
            format!("Wrong number of arguments: want 1 ({}), got 0", what),
        ));
    }
    if trimmed.contains(' ') {
        return Err(CommandError::new(
            cmd,
            format!("Wrong number of arguments: want 1 ({}), got 2", what),
        ));
    }
    Ok(trimmed.to_string())
}
