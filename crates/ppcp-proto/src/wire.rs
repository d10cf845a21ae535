//! Outbound PPCP packet builders.
//!
//! Builders produce wire fragments as strings; the network layer queues
//! them on sockets. Text and attribute values go through
//! [`crate::xml::escape`], so arbitrary user input cannot break framing.

use crate::ident::Status;
use crate::ppcp::{
    ATTR_ACTION, ATTR_DISPLAY_NAME, ATTR_MESSAGE, ATTR_NICK, ATTR_PORT, ATTR_STATE, ATTR_TO_NEG,
    ATTR_TO_NICK, MESSAGE_TAG, REQUEST_TAG, STATUS_TAG, WRAPPER_TAG,
};
use crate::xml::escape;

/// `<ppcp n="nick" p="port">` - open our side of an exchange.
pub fn wrapper_open(nick: &str, port: u16) -> String {
    format!(
        r#"<{WRAPPER_TAG} {ATTR_NICK}="{}" {ATTR_PORT}="{port}">"#,
        escape(nick)
    )
}

/// Wrapper open tag addressed to (or, with `neg`, away from) one nick.
pub fn wrapper_open_to(nick: &str, port: u16, to: &str, neg: bool) -> String {
    let mut out = format!(
        r#"<{WRAPPER_TAG} {ATTR_NICK}="{}" {ATTR_PORT}="{port}" {ATTR_TO_NICK}="{}""#,
        escape(nick),
        escape(to)
    );
    if neg {
        out.push_str(&format!(r#" {ATTR_TO_NEG}="1""#));
    }
    out.push('>');
    out
}

/// `</ppcp>` - close our side of an exchange.
pub fn wrapper_close() -> String {
    format!("</{WRAPPER_TAG}>")
}

/// Status element carrying presence, message and optional display name.
pub fn status_elem(status: &Status, display_name: &str) -> String {
    let mut out = format!(
        r#"<{STATUS_TAG} {ATTR_STATE}="{}""#,
        status.presence.as_wire()
    );
    if !display_name.is_empty() {
        out.push_str(&format!(
            r#" {ATTR_DISPLAY_NAME}="{}""#,
            escape(display_name)
        ));
    }
    out.push('>');
    out.push_str(&escape(&status.message));
    out.push_str(&format!("</{STATUS_TAG}>"));
    out
}

/// Unrestricted status request element.
pub fn request_elem() -> String {
    format!("<{REQUEST_TAG}></{REQUEST_TAG}>")
}

/// Message element; `action` selects third-person framing.
pub fn message_elem(text: &str, action: bool) -> String {
    let flag = if action { ATTR_ACTION } else { ATTR_MESSAGE };
    format!(
        r#"<{MESSAGE_TAG} {flag}="1">{}</{MESSAGE_TAG}>"#,
        escape(text)
    )
}

/// A complete one-shot datagram: wrapper around a body fragment.
pub fn datagram(nick: &str, port: u16, body: &str) -> String {
    let mut out = wrapper_open(nick, port);
    out.push_str(body);
    out.push_str(&wrapper_close());
    out
}
