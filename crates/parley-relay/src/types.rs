//! Core relay types.

use std::fmt;

use uuid::Uuid;

use crate::connection::Connection;

/// Opaque handle identifying one physical transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Allocate a fresh connection id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authenticated display name of a participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Identity {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// An admitted participant and the connection it speaks through.
///
/// Fixed for the life of the connection.
#[derive(Debug, Clone)]
pub struct Participant {
    pub identity: Identity,
    pub connection: Connection,
}

impl Participant {
    pub fn new(identity: Identity, connection: Connection) -> Self {
        Self {
            identity,
            connection,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }
}

/// Kind of relayed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Text sent by a participant
    Chat,
    /// Presence: participant was admitted
    Joined,
    /// Presence: participant went away
    Left,
}

/// A message on its way to every registered connection. Never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub kind: MessageKind,
    pub sender_identity: Identity,
    pub body: String,
}

impl ChatMessage {
    pub fn chat(sender: &Identity, body: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Chat,
            sender_identity: sender.clone(),
            body: body.into(),
        }
    }

    pub fn joined(who: &Identity) -> Self {
        Self {
            kind: MessageKind::Joined,
            sender_identity: who.clone(),
            body: String::new(),
        }
    }

    pub fn left(who: &Identity) -> Self {
        Self {
            kind: MessageKind::Left,
            sender_identity: who.clone(),
            body: String::new(),
        }
    }

    /// Render the outbound text frame.
    ///
    /// Identities are not escaped; a name containing `": "` makes chat
    /// lines ambiguous to readers.
    pub fn to_wire(&self) -> String {
        match self.kind {
            MessageKind::Chat => format!("{}: {}", self.sender_identity, self.body),
            MessageKind::Joined => format!("System: {} joined the chat", self.sender_identity),
            MessageKind::Left => format!("System: {} left the chat", self.sender_identity),
        }
    }
}

/// Transport-neutral inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
    /// Ping, pong and other frames with no chat payload
    Control,
}
