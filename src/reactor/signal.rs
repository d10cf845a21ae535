//! Signals: addressed, typed, optionally payload-bearing messages delivered
//! between modules.
//!
//! A signal's receiver is either an exact module name (`/ui/term`) or a
//! prefix ending in `/` (`/ui/`), which delivers to every module whose name
//! strictly extends the prefix. `/` broadcasts to everyone.

use ppcp_proto::{User, UserId};

use crate::net::users::SharedUsers;

/// Signal type names exchanged over the bus.
pub mod sig {
    /// One reactor timeout interval elapsed (broadcast).
    pub const TICK: &str = "/core/tick";
    /// A module was registered; payload is its name.
    pub const MODULE_NEW: &str = "/core/module/new";
    /// A module was removed; payload is its name.
    pub const MODULE_REMOVE: &str = "/core/module/remove";
    /// Shutdown request: all modules should wind down and exit.
    pub const MODULE_QUIT: &str = "/core/module/quit";
    /// Sent by a module to request its own removal. Core honors this
    /// regardless of the declared receiver.
    pub const MODULE_EXITS: &str = "/core/module/exits";
    /// Inbound: change our own user's status/name.
    pub const USER_CHANGE: &str = "/net/user/change";
    /// Outbound: a known user appeared, changed, or left.
    pub const USER_CHANGED: &str = "/net/user/changed";
    /// Request the shared users list.
    pub const USERS_RQ: &str = "/net/users/rq";
    /// Reply carrying the shared users list.
    pub const USERS_RP: &str = "/net/users/rp";
    /// Inbound: send a chat message to a peer.
    pub const MSG_SEND: &str = "/net/msg/send";
    /// Outbound: a chat message arrived from a peer.
    pub const MSG_GOT: &str = "/net/msg/got";
    /// User-visible error line.
    pub const ERROR: &str = "/ui/msg/error";
    /// Debug chatter.
    pub const DEBUG: &str = "/ui/msg/debug";
    /// Informational line.
    pub const INFO: &str = "/ui/msg/info";
    /// Notice line.
    pub const NOTICE: &str = "/ui/msg/notice";
}

/// What changed about a user, alongside the snapshot in [`UserChange`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeFlags {
    /// First time this user was seen.
    pub appeared: bool,
    /// The user was evicted or went away.
    pub left: bool,
    /// Presence state or status message changed.
    pub status: bool,
    /// Display name changed.
    pub name: bool,
}

/// Payload of `/net/user/change[d]`.
#[derive(Debug, Clone)]
pub struct UserChange {
    /// Snapshot of the user at the time of the change.
    pub user: User,
    /// Which fields changed.
    pub flags: ChangeFlags,
}

/// Payload of `/net/msg/send` and `/net/msg/got`.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// The peer: target when sending, sender when receiving.
    pub peer: UserId,
    /// Message text.
    pub text: String,
    /// Third-person "action" framing instead of plain message.
    pub action: bool,
}

/// Closed payload variant carried by a signal. Readers match on the
/// variant; there is no downcasting.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Free-form text (module names, error lines).
    Str(String),
    /// A user snapshot plus change flags.
    UserChange(UserChange),
    /// A chat message.
    Message(ChatMessage),
    /// The shared, reference-counted users table.
    Users(SharedUsers),
}

/// An addressed message between modules.
#[derive(Debug, Clone)]
pub struct Signal {
    /// Hierarchical slash-separated type name (see [`sig`]).
    pub kind: &'static str,
    /// Name of the emitting module.
    pub sender: String,
    /// Exact module name, or prefix ending in `/`.
    pub receiver: String,
    /// Optional payload.
    pub payload: Option<Payload>,
}

impl Signal {
    /// Create a payload-less signal.
    pub fn new(kind: &'static str, sender: impl Into<String>, receiver: impl Into<String>) -> Self {
        Self {
            kind,
            sender: sender.into(),
            receiver: receiver.into(),
            payload: None,
        }
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// The string payload, if that is what this signal carries.
    pub fn as_str_payload(&self) -> Option<&str> {
        match &self.payload {
            Some(Payload::Str(s)) => Some(s),
            _ => None,
        }
    }
}
