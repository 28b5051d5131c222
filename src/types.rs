//! Basic type definitions for the chat node
//!
//! One macro declares the UUID-backed id newtypes (`ClientId`, `RoomId`,
//! `NodeId`) so the constructors and trait impls every id shares are
//! defined once.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declare a UUID v4 id newtype with the shared constructors and impls.
/// Each id hashes and serializes as its inner uuid.
macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random id
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id! {
    /// Unique client identifier, assigned at accept time
    ClientId
}

uuid_id! {
    /// Unique room identifier; the node's name index maps display names
    /// (including DM-pair aliases) onto this id
    RoomId
}

uuid_id! {
    /// Unique node identifier, exchanged in the federation handshake
    NodeId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ClientId::new(), ClientId::new());
        assert_ne!(RoomId::new(), RoomId::new());
        assert_ne!(NodeId::new(), NodeId::new());
    }

    #[test]
    fn test_display_matches_inner_uuid() {
        let id = ClientId::new();
        assert_eq!(id.to_string(), id.0.to_string());
        assert_eq!(id.to_string().parse::<Uuid>().unwrap(), id.0);
    }

    #[test]
    fn test_serializes_as_bare_uuid() {
        let id = RoomId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.0));
        let back: RoomId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
