//! PPCP protocol tokenizer.
//!
//! Folds XML tokens into protocol tokens. One instance tracks one logical
//! peer stream: a TCP connection keeps its tokenizer for the connection's
//! lifetime, a UDP datagram gets a transient one.
//!
//! The wrapper element's open tag carries the sender's nick and listening
//! port, plus an optional `to:n`/`to:neg` pair that addresses (or excludes)
//! a specific receiving nick. Validation failures on the wrapper never raise
//! an error: the tokenizer mutes the rest of the element and emits
//! [`PpcpToken::Ignore`], which is also how our own multicast echo is
//! suppressed. Unrecognized child elements are skipped silently, tracking
//! nesting depth so arbitrary unknown subtrees cannot desynchronize the
//! stream.

use crate::error::XmlError;
use crate::ident::{Presence, MIN_PORT};
use crate::nick::is_valid_nick;
use crate::xml::{XmlToken, XmlTokenizer};

/// Outer per-peer wrapper element name.
pub const WRAPPER_TAG: &str = "ppcp";
/// Sender nick attribute on the wrapper.
pub const ATTR_NICK: &str = "n";
/// Sender listening-port attribute on the wrapper.
pub const ATTR_PORT: &str = "p";
/// Addressed-receiver nick attribute on the wrapper.
pub const ATTR_TO_NICK: &str = "to:n";
/// Negation flag for [`ATTR_TO_NICK`].
pub const ATTR_TO_NEG: &str = "to:neg";
/// Status child element name.
pub const STATUS_TAG: &str = "st";
/// Presence-state attribute on the status element.
pub const ATTR_STATE: &str = "st";
/// Display-name attribute on the status element.
pub const ATTR_DISPLAY_NAME: &str = "dn";
/// Status-request child element name.
pub const REQUEST_TAG: &str = "rq";
/// Message child element name.
pub const MESSAGE_TAG: &str = "msg";
/// "Action" framing flag on the message element.
pub const ATTR_ACTION: &str = "ac";
/// "Plain message" framing flag on the message element.
pub const ATTR_MESSAGE: &str = "msg";

/// A protocol-level event decoded from one peer stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PpcpToken {
    /// A valid wrapper element opened: the peer identified itself.
    Open {
        /// Declared canonical nick.
        nick: String,
        /// Declared listening port (validated 1024-65535).
        port: u16,
    },
    /// A status element closed.
    Status {
        /// Presence state from the `st` attribute.
        presence: Presence,
        /// Free-text status message (element content).
        message: String,
        /// Display name from the `dn` attribute; empty if absent.
        name: String,
    },
    /// A status request with no state restriction.
    Request,
    /// A chat message element closed.
    Message {
        /// Message text (element content).
        text: String,
        /// True for "action" framing (third-person), false for plain.
        action: bool,
    },
    /// The wrapper element closed cleanly.
    Close,
    /// The wrapper element failed validation and the rest of it is muted.
    /// At the outer level this ends the exchange like a close would.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resume {
    Start,
    InPpcp,
    InStatus,
    InRequest,
    InMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Outside any wrapper element.
    Start,
    /// Inside the wrapper's open tag, collecting attributes.
    WrapperOpen,
    /// Inside the wrapper, between child elements.
    InPpcp,
    /// Inside a status element.
    InStatus,
    /// Inside a request element.
    InRequest,
    /// Inside a message element.
    InMessage,
    /// Skipping an unrecognized (or muted) subtree.
    Ignoring { depth: u32, resume: Resume },
}

impl From<Resume> for State {
    fn from(r: Resume) -> Self {
        match r {
            Resume::Start => State::Start,
            Resume::InPpcp => State::InPpcp,
            Resume::InStatus => State::InStatus,
            Resume::InRequest => State::InRequest,
            Resume::InMessage => State::InMessage,
        }
    }
}

/// Interpret a boolean-like attribute value.
fn truthy(v: &str) -> bool {
    !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false")
}

/// Folds XML tokens into [`PpcpToken`]s for one peer stream.
#[derive(Debug)]
pub struct PpcpTokenizer {
    our_nick: String,
    our_port: u16,
    state: State,
    cur_attr: Option<String>,
    // Wrapper open-tag attributes.
    peer_nick: String,
    peer_port: Option<u16>,
    to_nick: Option<String>,
    to_neg: bool,
    // Current child element accumulators.
    attr_state: Option<String>,
    attr_name: String,
    attr_action: bool,
    text: String,
}

impl PpcpTokenizer {
    /// Create a tokenizer that validates against our own nick and listening
    /// port (for `to:n` addressing and multicast echo suppression).
    pub fn new(our_nick: impl Into<String>, our_port: u16) -> Self {
        Self {
            our_nick: our_nick.into(),
            our_port,
            state: State::Start,
            cur_attr: None,
            peer_nick: String::new(),
            peer_port: None,
            to_nick: None,
            to_neg: false,
            attr_state: None,
            attr_name: String::new(),
            attr_action: false,
            text: String::new(),
        }
    }

    /// Pull the next protocol token, driving the XML tokenizer internally
    /// until a token is produced or its input is exhausted.
    pub fn next_token(&mut self, xml: &mut XmlTokenizer) -> Result<Option<PpcpToken>, XmlError> {
        while let Some(tok) = xml.next_token()? {
            if let Some(ppcp) = self.fold(tok) {
                return Ok(Some(ppcp));
            }
        }
        Ok(None)
    }

    fn reset_child(&mut self) {
        self.cur_attr = None;
        self.attr_state = None;
        self.attr_name.clear();
        self.attr_action = false;
        self.text.clear();
    }

    fn enter_ignoring(&mut self, resume: Resume) {
        self.state = State::Ignoring { depth: 1, resume };
    }

    /// Validate the collected wrapper attributes; on success emit `Open` and
    /// enter the wrapper, on failure mute the element.
    fn finish_wrapper_open(&mut self) -> PpcpToken {
        let valid = 'v: {
            if !is_valid_nick(&self.peer_nick) {
                break 'v false;
            }
            let Some(port) = self.peer_port else {
                break 'v false;
            };
            if port < MIN_PORT {
                break 'v false;
            }
            if let Some(to) = &self.to_nick {
                let mut addressed = *to == self.our_nick;
                if self.to_neg {
                    addressed = !addressed;
                }
                if !addressed {
                    break 'v false;
                }
            }
            // Our own multicast echo: same declared nick and port as ours.
            !(self.peer_nick == self.our_nick && port == self.our_port)
        };

        if valid {
            self.state = State::InPpcp;
            PpcpToken::Open {
                nick: std::mem::take(&mut self.peer_nick),
                port: self.peer_port.unwrap_or(0),
            }
        } else {
            self.enter_ignoring(Resume::Start);
            PpcpToken::Ignore
        }
    }

    /// Fold one XML token. Most tokens only update internal state; element
    /// closes are what produce protocol tokens.
    fn fold(&mut self, tok: XmlToken) -> Option<PpcpToken> {
        match self.state {
            State::Start => {
                if let XmlToken::TagOpen(name) = tok {
                    if name == WRAPPER_TAG {
                        self.peer_nick.clear();
                        self.peer_port = None;
                        self.to_nick = None;
                        self.to_neg = false;
                        self.cur_attr = None;
                        self.state = State::WrapperOpen;
                    } else {
                        self.enter_ignoring(Resume::Start);
                    }
                }
                None
            }

            State::WrapperOpen => {
                match tok {
                    XmlToken::AttrName(name) => self.cur_attr = Some(name),
                    XmlToken::AttrValue(value) => match self.cur_attr.take().as_deref() {
                        Some(ATTR_NICK) => self.peer_nick = value,
                        Some(ATTR_PORT) => self.peer_port = value.parse().ok(),
                        Some(ATTR_TO_NICK) => self.to_nick = Some(value),
                        Some(ATTR_TO_NEG) => self.to_neg = truthy(&value),
                        _ => {}
                    },
                    XmlToken::TagClose => return Some(self.finish_wrapper_open()),
                    _ => {}
                }
                None
            }

            State::InPpcp => match tok {
                XmlToken::TagOpen(name) => {
                    self.reset_child();
                    match name.as_str() {
                        STATUS_TAG => self.state = State::InStatus,
                        REQUEST_TAG => self.state = State::InRequest,
                        MESSAGE_TAG => self.state = State::InMessage,
                        _ => self.enter_ignoring(Resume::InPpcp),
                    }
                    None
                }
                XmlToken::ElementClose(_) => {
                    self.state = State::Start;
                    Some(PpcpToken::Close)
                }
                _ => None,
            },

            State::InStatus => match tok {
                XmlToken::AttrName(name) => {
                    self.cur_attr = Some(name);
                    None
                }
                XmlToken::AttrValue(value) => {
                    match self.cur_attr.take().as_deref() {
                        Some(ATTR_STATE) => self.attr_state = Some(value),
                        Some(ATTR_DISPLAY_NAME) => self.attr_name = value,
                        _ => {}
                    }
                    None
                }
                XmlToken::Text(t) => {
                    self.text.push_str(&t);
                    None
                }
                XmlToken::TagOpen(_) => {
                    self.enter_ignoring(Resume::InStatus);
                    None
                }
                XmlToken::ElementClose(_) => {
                    self.state = State::InPpcp;
                    let presence = self.attr_state.take().and_then(|s| Presence::from_wire(&s))?;
                    Some(PpcpToken::Status {
                        presence,
                        message: std::mem::take(&mut self.text),
                        name: std::mem::take(&mut self.attr_name),
                    })
                }
                _ => None,
            },

            State::InRequest => match tok {
                XmlToken::AttrName(name) => {
                    self.cur_attr = Some(name);
                    None
                }
                XmlToken::AttrValue(value) => {
                    if self.cur_attr.take().as_deref() == Some(ATTR_STATE) {
                        self.attr_state = Some(value);
                    }
                    None
                }
                XmlToken::TagOpen(_) => {
                    self.enter_ignoring(Resume::InRequest);
                    None
                }
                XmlToken::ElementClose(_) => {
                    self.state = State::InPpcp;
                    // A state-restricted request is not for us to answer.
                    if self.attr_state.take().is_none() {
                        Some(PpcpToken::Request)
                    } else {
                        None
                    }
                }
                _ => None,
            },

            State::InMessage => match tok {
                XmlToken::AttrName(name) => {
                    self.cur_attr = Some(name);
                    None
                }
                XmlToken::AttrValue(value) => {
                    match self.cur_attr.take().as_deref() {
                        Some(ATTR_ACTION) => self.attr_action = truthy(&value),
                        Some(ATTR_MESSAGE) => {
                            if truthy(&value) {
                                self.attr_action = false;
                            }
                        }
                        _ => {}
                    }
                    None
                }
                XmlToken::Text(t) => {
                    self.text.push_str(&t);
                    None
                }
                XmlToken::TagOpen(_) => {
                    self.enter_ignoring(Resume::InMessage);
                    None
                }
                XmlToken::ElementClose(_) => {
                    self.state = State::InPpcp;
                    Some(PpcpToken::Message {
                        text: std::mem::take(&mut self.text),
                        action: self.attr_action,
                    })
                }
                _ => None,
            },

            State::Ignoring { depth, resume } => {
                match tok {
                    XmlToken::TagOpen(_) => {
                        self.state = State::Ignoring {
                            depth: depth + 1,
                            resume,
                        };
                    }
                    XmlToken::ElementClose(_) => {
                        if depth == 1 {
                            self.state = resume.into();
                        } else {
                            self.state = State::Ignoring {
                                depth: depth - 1,
                                resume,
                            };
                        }
                    }
                    _ => {}
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(our_nick: &str, our_port: u16, input: &str) -> Vec<PpcpToken> {
        let mut xml = XmlTokenizer::new();
        let mut ppcp = PpcpTokenizer::new(our_nick, our_port);
        xml.feed(input.as_bytes());
        let mut out = Vec::new();
        while let Some(tok) = ppcp.next_token(&mut xml).unwrap() {
            out.push(tok);
        }
        out
    }

    #[test]
    fn test_status_exchange() {
        let toks = drive(
            "alice",
            9001,
            r#"<ppcp n="bob" p="9000"><st st="away" dn="Bob D.">brb</st></ppcp>"#,
        );
        assert_eq!(
            toks,
            vec![
                PpcpToken::Open {
                    nick: "bob".into(),
                    port: 9000
                },
                PpcpToken::Status {
                    presence: Presence::Away,
                    message: "brb".into(),
                    name: "Bob D.".into()
                },
                PpcpToken::Close,
            ]
        );
    }

    #[test]
    fn test_message_framing() {
        let toks = drive(
            "alice",
            9001,
            r#"<ppcp n="bob" p="9000"><msg ac="1">waves</msg><msg msg="1">hi</msg></ppcp>"#,
        );
        assert_eq!(
            toks,
            vec![
                PpcpToken::Open {
                    nick: "bob".into(),
                    port: 9000
                },
                PpcpToken::Message {
                    text: "waves".into(),
                    action: true
                },
                PpcpToken::Message {
                    text: "hi".into(),
                    action: false
                },
                PpcpToken::Close,
            ]
        );
    }

    #[test]
    fn test_request_plain_and_restricted() {
        let toks = drive(
            "alice",
            9001,
            r#"<ppcp n="bob" p="9000"><rq></rq><rq st="online"></rq></ppcp>"#,
        );
        assert_eq!(
            toks,
            vec![
                PpcpToken::Open {
                    nick: "bob".into(),
                    port: 9000
                },
                PpcpToken::Request,
                PpcpToken::Close,
            ]
        );
    }

    #[test]
    fn test_self_echo_is_muted() {
        // Our own nick and port: syntactically valid but must emit no Open.
        let toks = drive(
            "alice",
            9001,
            r#"<ppcp n="alice" p="9001"><st st="online">here</st></ppcp>"#,
        );
        assert_eq!(toks, vec![PpcpToken::Ignore]);
    }

    #[test]
    fn test_addressed_to_other_nick_is_muted() {
        let toks = drive(
            "alice",
            9001,
            r#"<ppcp n="bob" p="9000" to:n="carol"><msg>psst</msg></ppcp>"#,
        );
        assert_eq!(toks, vec![PpcpToken::Ignore]);
    }

    #[test]
    fn test_addressed_to_us() {
        let toks = drive(
            "alice",
            9001,
            r#"<ppcp n="bob" p="9000" to:n="alice"><msg>psst</msg></ppcp>"#,
        );
        assert_eq!(toks.len(), 3);
        assert!(matches!(toks[0], PpcpToken::Open { .. }));
    }

    #[test]
    fn test_negated_addressing() {
        // to:n + to:neg excludes the named nick.
        let excluded = drive(
            "alice",
            9001,
            r#"<ppcp n="bob" p="9000" to:n="alice" to:neg="1"><msg>x</msg></ppcp>"#,
        );
        assert_eq!(excluded, vec![PpcpToken::Ignore]);

        let included = drive(
            "alice",
            9001,
            r#"<ppcp n="bob" p="9000" to:n="carol" to:neg="1"><msg>x</msg></ppcp>"#,
        );
        assert!(matches!(included[0], PpcpToken::Open { .. }));
    }

    #[test]
    fn test_bad_port_is_muted() {
        for port in ["80", "0", "65536", "not-a-port", ""] {
            let doc = format!(r#"<ppcp n="bob" p="{port}"><st st="online">x</st></ppcp>"#);
            assert_eq!(drive("alice", 9001, &doc), vec![PpcpToken::Ignore], "port {port}");
        }
    }

    #[test]
    fn test_invalid_nick_is_muted() {
        let toks = drive("alice", 9001, r#"<ppcp n="Bob Dobbs" p="9000"></ppcp>"#);
        assert_eq!(toks, vec![PpcpToken::Ignore]);
    }

    #[test]
    fn test_unknown_children_are_skipped() {
        let toks = drive(
            "alice",
            9001,
            r#"<ppcp n="bob" p="9000"><fancy><deep>no</deep></fancy><st st="dnd">busy</st></ppcp>"#,
        );
        assert_eq!(
            toks,
            vec![
                PpcpToken::Open {
                    nick: "bob".into(),
                    port: 9000
                },
                PpcpToken::Status {
                    presence: Presence::Busy,
                    message: "busy".into(),
                    name: String::new()
                },
                PpcpToken::Close,
            ]
        );
    }

    #[test]
    fn test_unknown_status_token_is_skipped() {
        let toks = drive(
            "alice",
            9001,
            r#"<ppcp n="bob" p="9000"><st st="chatty">x</st></ppcp>"#,
        );
        assert_eq!(
            toks,
            vec![
                PpcpToken::Open {
                    nick: "bob".into(),
                    port: 9000
                },
                PpcpToken::Close,
            ]
        );
    }

    #[test]
    fn test_resumes_across_partial_input() {
        let mut xml = XmlTokenizer::new();
        let mut ppcp = PpcpTokenizer::new("alice", 9001);
        xml.feed(br#"<ppcp n="bob" p="90"#);
        assert_eq!(ppcp.next_token(&mut xml).unwrap(), None);
        xml.feed(br#"00"><st st="online">he"#);
        assert_eq!(
            ppcp.next_token(&mut xml).unwrap(),
            Some(PpcpToken::Open {
                nick: "bob".into(),
                port: 9000
            })
        );
        assert_eq!(ppcp.next_token(&mut xml).unwrap(), None);
        xml.feed(br#"re</st></ppcp>"#);
        assert_eq!(
            ppcp.next_token(&mut xml).unwrap(),
            Some(PpcpToken::Status {
                presence: Presence::Online,
                message: "here".into(),
                name: String::new()
            })
        );
        assert_eq!(ppcp.next_token(&mut xml).unwrap(), Some(PpcpToken::Close));
    }
}
