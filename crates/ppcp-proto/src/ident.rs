//! Peer identity types.
//!
//! A peer is identified by a [`UserId`]: its canonical nick plus the
//! [`Addr`] it advertises (source IP and listening port). The same identity
//! key is used across both transports, so a peer seen over multicast and
//! over a direct TCP link resolves to one record.

use std::cmp::Ordering;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::error::IdentityError;
use crate::nick::{is_valid_nick, nick_from_name};

/// Lowest port peers may advertise.
pub const MIN_PORT: u16 = 1024;

/// An IPv4 endpoint address.
///
/// Total order is numeric by address, then port (the derived order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Addr {
    /// IPv4 address.
    pub ip: Ipv4Addr,
    /// Port number.
    pub port: u16,
}

impl Addr {
    /// Create an address from its parts.
    pub const fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl From<SocketAddrV4> for Addr {
    fn from(sa: SocketAddrV4) -> Self {
        Self::new(*sa.ip(), sa.port())
    }
}

impl From<Addr> for SocketAddr {
    fn from(a: Addr) -> Self {
        SocketAddr::V4(SocketAddrV4::new(a.ip, a.port))
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Identity key for a peer: canonical nick plus advertised address.
///
/// Ordering is explicit and non-default (by address, then nick length,
/// then lexicographically) and is the key order of the user table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId {
    nick: String,
    addr: Addr,
}

impl UserId {
    /// Create an identity, validating the nick and port.
    pub fn new(nick: impl Into<String>, addr: Addr) -> Result<Self, IdentityError> {
        let nick = nick.into();
        if !is_valid_nick(&nick) {
            return Err(IdentityError::InvalidNick(nick));
        }
        if addr.port < MIN_PORT {
            return Err(IdentityError::PortOutOfRange(addr.port));
        }
        Ok(Self { nick, addr })
    }

    /// The canonical nick.
    pub fn nick(&self) -> &str {
        &self.nick
    }

    /// The advertised address.
    pub fn addr(&self) -> Addr {
        self.addr
    }
}

impl Ord for UserId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr
            .cmp(&other.addr)
            .then_with(|| self.nick.len().cmp(&other.nick.len()))
            .then_with(|| self.nick.cmp(&other.nick))
    }
}

impl PartialOrd for UserId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.nick, self.addr)
    }
}

/// Presence state of a peer, carried in the `st` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Presence {
    /// Not reachable.
    #[default]
    Offline,
    /// Present and active.
    Online,
    /// Temporarily away.
    Away,
    /// Away for an extended period.
    ExtendedAway,
    /// Present but does not want to be disturbed.
    Busy,
}

impl Presence {
    /// The wire token used in the `st` attribute.
    pub const fn as_wire(self) -> &'static str {
        match self {
            Self::Offline => "off",
            Self::Online => "online",
            Self::Away => "away",
            Self::ExtendedAway => "xa",
            Self::Busy => "dnd",
        }
    }

    /// Parse a wire token. Unknown tokens yield `None`.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Offline),
            "online" => Some(Self::Online),
            "away" => Some(Self::Away),
            "xa" => Some(Self::ExtendedAway),
            "dnd" => Some(Self::Busy),
            _ => None,
        }
    }
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Offline => "offline",
            Self::Online => "online",
            Self::Away => "away",
            Self::ExtendedAway => "extended away",
            Self::Busy => "busy",
        };
        f.write_str(s)
    }
}

/// A presence state plus its free-text message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Status {
    /// Presence state.
    pub presence: Presence,
    /// Free-text status message (may be empty).
    pub message: String,
}

impl Status {
    /// Create a status from its parts.
    pub fn new(presence: Presence, message: impl Into<String>) -> Self {
        Self {
            presence,
            message: message.into(),
        }
    }
}

/// A known peer: identity, display name and current status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Identity key.
    pub id: UserId,
    /// Display name; empty means "use the nick".
    pub name: String,
    /// Current status.
    pub status: Status,
}

impl User {
    /// Create a user with an empty display name and default (offline) status.
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            name: String::new(),
            status: Status::default(),
        }
    }

    /// The name to show for this user: the display name if set, else the nick.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.id.nick()
        } else {
            &self.name
        }
    }

    /// Whether the display name still canonicalizes to the nick.
    pub fn name_is_consistent(&self) -> bool {
        self.name.is_empty() || nick_from_name(&self.name) == self.id.nick()
    }
}
