//! # ppcp-proto
//!
//! Protocol library for PPCP, the small XML-dialect wire protocol used for
//! LAN peer discovery, presence and messaging.
//!
//! ## Layers
//!
//! - [`xml`]: an incremental, restartable XML tokenizer that tolerates token
//!   boundaries anywhere in the input, plus the entity escaping rules of the
//!   wire format.
//! - [`ppcp`]: the protocol tokenizer that folds XML tokens into semantic
//!   events (`Open`, `Status`, `Request`, `Message`, `Close`), including the
//!   wrapper-attribute validation and self-mute rules.
//! - [`wire`]: builders for the outbound direction.
//! - [`ident`] and [`nick`]: peer identity (nick + address), presence
//!   states, and the nick canonicalization function.
//!
//! ## Quick Start
//!
//! ```rust
//! use ppcp_proto::ppcp::{PpcpToken, PpcpTokenizer};
//! use ppcp_proto::xml::XmlTokenizer;
//!
//! let mut xml = XmlTokenizer::new();
//! let mut ppcp = PpcpTokenizer::new("alice", 9001);
//!
//! // Bytes arrive in arbitrary slices from a non-blocking socket.
//! xml.feed(br#"<ppcp n="bob" p="9000"><st st="away">brb</st>"#);
//! assert_eq!(
//!     ppcp.next_token(&mut xml).unwrap(),
//!     Some(PpcpToken::Open { nick: "bob".into(), port: 9000 })
//! );
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod error;
pub mod ident;
pub mod nick;
pub mod ppcp;
pub mod wire;
pub mod xml;

pub use error::{IdentityError, Result, XmlError};
pub use ident::{Addr, Presence, Status, User, UserId};
pub use nick::{name_matches_nick, nick_from_name};
pub use ppcp::{PpcpToken, PpcpTokenizer};
pub use xml::{XmlToken, XmlTokenizer};
