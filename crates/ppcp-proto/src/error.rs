//! Error types for the PPCP protocol library.
//!
//! This module defines error types for XML-level grammar violations and
//! identity (nick/display-name) validation failures. Protocol-level attribute
//! validation failures are deliberately *not* errors: the PPCP tokenizer
//! self-mutes the offending element instead (see [`crate::ppcp`]).

use thiserror::Error;

/// Convenience type alias for Results using [`XmlError`].
pub type Result<T, E = XmlError> = std::result::Result<T, E>;

/// Errors raised by the incremental XML tokenizer.
///
/// Any of these aborts parsing of the connection or datagram that produced
/// the bytes; the stream cannot be resynchronized afterwards.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum XmlError {
    /// A byte that is not legal in the current tokenizer state.
    #[error("unexpected byte {byte:#04x} in {state}")]
    UnexpectedByte {
        /// The offending byte value.
        byte: u8,
        /// Human-readable name of the tokenizer state.
        state: &'static str,
    },

    /// A closing tag that does not match the innermost open element.
    #[error("mismatched closing tag: expected </{expected}>, found </{found}>")]
    MismatchedClose {
        /// Name of the innermost open element.
        expected: String,
        /// Name found in the closing tag.
        found: String,
    },

    /// A closing tag with no open element on the stack.
    #[error("closing tag </{0}> with no open element")]
    UnexpectedClose(String),

    /// An entity reference that is not one of the recognized forms
    /// (`&lt;`, `&gt;`, `&amp;`, `&#NNN;`, `&#xHH;`).
    #[error("unrecognized entity reference: &{0}")]
    BadEntity(String),

    /// A numeric character reference outside the Unicode scalar range.
    #[error("character reference out of range: {0:#x}")]
    CharOutOfRange(u32),

    /// Token text that is not valid UTF-8.
    #[error("invalid UTF-8 in token text at byte {0}")]
    InvalidUtf8(usize),

    /// Input ended with open elements or a partially-scanned token.
    #[error("truncated document: {0} element(s) still open")]
    TruncatedDocument(usize),
}

/// Errors raised when constructing identity values.
///
/// Per the error-handling design these are rejected at construction and
/// surfaced to the caller; identities are never silently coerced.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum IdentityError {
    /// The nick is empty, too long, or not in canonical form.
    #[error("invalid nick: {0:?}")]
    InvalidNick(String),

    /// The advertised protocol port is outside the allowed 1024-65535 range.
    #[error("port out of range: {0}")]
    PortOutOfRange(u16),
}
