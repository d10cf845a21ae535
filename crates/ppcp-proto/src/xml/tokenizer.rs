//! Incremental XML pull tokenizer.
//!
//! The tokenizer scans a growing byte buffer and must tolerate token
//! boundaries falling anywhere, including inside an entity reference: bytes
//! arrive from a non-blocking socket in arbitrary slices. Scanned bytes are
//! moved out of the buffer into per-token accumulators as they are consumed,
//! so a resumed call never re-scans input it already tokenized.
//!
//! The grammar is the small dialect the wire protocol needs: open/close
//! tags, quoted attributes, character data, and the entity forms of
//! [`crate::xml::escape`]. No comments, processing instructions, CDATA
//! sections or self-closing tags.

use bytes::{Buf, BytesMut};
use smallvec::SmallVec;

use crate::error::XmlError;
use crate::xml::escape::unescape;

/// A structural token produced by the tokenizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlToken {
    /// `<name` - start of an opening tag.
    TagOpen(String),
    /// An attribute name inside an opening tag.
    AttrName(String),
    /// An attribute value, entities resolved.
    AttrValue(String),
    /// `>` terminating an opening tag; attributes are complete.
    TagClose,
    /// Character data, entities resolved.
    Text(String),
    /// `</name>` - the element is closed.
    ElementClose(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Start,
    InText,
    InOpenTagName,
    InCloseTagName,
    InsideOpenTag,
    InAttrName,
    AfterAttrName,
    AfterEquals,
    InAttrValue(u8),
    AfterCloseTagName,
}

impl State {
    const fn name(self) -> &'static str {
        match self {
            Self::Start => "document start",
            Self::InText => "character data",
            Self::InOpenTagName => "opening tag name",
            Self::InCloseTagName => "closing tag name",
            Self::InsideOpenTag => "opening tag",
            Self::InAttrName => "attribute name",
            Self::AfterAttrName => "after attribute name",
            Self::AfterEquals => "after '='",
            Self::InAttrValue(_) => "attribute value",
            Self::AfterCloseTagName => "after closing tag name",
        }
    }
}

#[inline]
const fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b':' | b'_' | b'-' | b'.')
}

#[inline]
const fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

/// Incremental, restartable XML tokenizer.
///
/// Feed bytes with [`feed`](Self::feed), then pull tokens with
/// [`next_token`](Self::next_token) until it returns `Ok(None)`; the
/// tokenizer keeps partial-token state across calls. [`done`](Self::done)
/// verifies that a complete document was seen.
#[derive(Debug, Default)]
pub struct XmlTokenizer {
    buf: BytesMut,
    state: State,
    scratch: Vec<u8>,
    stack: SmallVec<[String; 4]>,
    pending: Option<XmlToken>,
}

impl XmlTokenizer {
    /// Create an empty tokenizer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes to the input buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull the next token.
    ///
    /// Returns `Ok(None)` when the input is exhausted mid-token; feeding
    /// more bytes resumes exactly where scanning stopped.
    pub fn next_token(&mut self) -> Result<Option<XmlToken>, XmlError> {
        if let Some(tok) = self.pending.take() {
            return Ok(Some(tok));
        }
        while !self.buf.is_empty() {
            let b = self.buf[0];
            self.buf.advance(1);
            if let Some(tok) = self.step(b)? {
                return Ok(Some(tok));
            }
        }
        Ok(None)
    }

    /// Check that the document is complete: no open elements, no partial
    /// token, no buffered input.
    pub fn done(&self) -> Result<(), XmlError> {
        if !self.stack.is_empty() {
            return Err(XmlError::TruncatedDocument(self.stack.len()));
        }
        let idle = self.state == State::Start
            && self.scratch.is_empty()
            && self.pending.is_none()
            && self.buf.is_empty();
        if idle {
            Ok(())
        } else {
            Err(XmlError::TruncatedDocument(0))
        }
    }

    fn unexpected(&self, b: u8) -> XmlError {
        XmlError::UnexpectedByte {
            byte: b,
            state: self.state.name(),
        }
    }

    /// Take the accumulated scratch bytes as a (non-entity) name string.
    fn take_name(&mut self) -> Result<String, XmlError> {
        let bytes = std::mem::take(&mut self.scratch);
        String::from_utf8(bytes).map_err(|e| XmlError::InvalidUtf8(e.utf8_error().valid_up_to()))
    }

    /// Take the accumulated scratch bytes as text with entities resolved.
    fn take_text(&mut self) -> Result<String, XmlError> {
        let raw = self.take_name()?;
        unescape(&raw)
    }

    fn close_element(&mut self) -> Result<Option<XmlToken>, XmlError> {
        let name = self.take_name()?;
        match self.stack.pop() {
            Some(top) if top == name => {
                self.state = if self.stack.is_empty() {
                    State::Start
                } else {
                    State::InText
                };
                Ok(Some(XmlToken::ElementClose(name)))
            }
            Some(top) => Err(XmlError::MismatchedClose {
                expected: top,
                found: name,
            }),
            None => Err(XmlError::UnexpectedClose(name)),
        }
    }

    /// Advance the state machine by one input byte, possibly completing a
    /// token.
    fn step(&mut self, b: u8) -> Result<Option<XmlToken>, XmlError> {
        match self.state {
            State::Start => match b {
                _ if is_space(b) => Ok(None),
                b'<' => {
                    self.state = State::InOpenTagName;
                    Ok(None)
                }
                _ => Err(self.unexpected(b)),
            },

            State::InText => {
                if b == b'<' {
                    self.state = State::InOpenTagName;
                    if self.scratch.is_empty() {
                        Ok(None)
                    } else {
                        Ok(Some(XmlToken::Text(self.take_text()?)))
                    }
                } else {
                    self.scratch.push(b);
                    Ok(None)
                }
            }

            State::InOpenTagName => match b {
                b'/' if self.scratch.is_empty() => {
                    self.state = State::InCloseTagName;
                    Ok(None)
                }
                _ if is_name_byte(b) => {
                    self.scratch.push(b);
                    Ok(None)
                }
                _ if is_space(b) && !self.scratch.is_empty() => {
                    let name = self.take_name()?;
                    self.stack.push(name.clone());
                    self.state = State::InsideOpenTag;
                    Ok(Some(XmlToken::TagOpen(name)))
                }
                b'>' if !self.scratch.is_empty() => {
                    let name = self.take_name()?;
                    self.stack.push(name.clone());
                    self.state = State::InText;
                    self.pending = Some(XmlToken::TagClose);
                    Ok(Some(XmlToken::TagOpen(name)))
                }
                _ => Err(self.unexpected(b)),
            },

            State::InsideOpenTag => match b {
                _ if is_space(b) => Ok(None),
                b'>' => {
                    self.state = State::InText;
                    Ok(Some(XmlToken::TagClose))
                }
                _ if is_name_byte(b) => {
                    self.scratch.push(b);
                    self.state = State::InAttrName;
                    Ok(None)
                }
                _ => Err(self.unexpected(b)),
            },

            State::InAttrName => match b {
                _ if is_name_byte(b) => {
                    self.scratch.push(b);
                    Ok(None)
                }
                b'=' => {
                    self.state = State::AfterEquals;
                    Ok(Some(XmlToken::AttrName(self.take_name()?)))
                }
                _ if is_space(b) => {
                    self.state = State::AfterAttrName;
                    Ok(Some(XmlToken::AttrName(self.take_name()?)))
                }
                _ => Err(self.unexpected(b)),
            },

            State::AfterAttrName => match b {
                _ if is_space(b) => Ok(None),
                b'=' => {
                    self.state = State::AfterEquals;
                    Ok(None)
                }
                _ => Err(self.unexpected(b)),
            },

            State::AfterEquals => match b {
                _ if is_space(b) => Ok(None),
                b'"' | b'\'' => {
                    self.state = State::InAttrValue(b);
                    Ok(None)
                }
                _ => Err(self.unexpected(b)),
            },

            State::InAttrValue(quote) => {
                if b == quote {
                    self.state = State::InsideOpenTag;
                    Ok(Some(XmlToken::AttrValue(self.take_text()?)))
                } else {
                    self.scratch.push(b);
                    Ok(None)
                }
            }

            State::InCloseTagName => match b {
                _ if is_name_byte(b) => {
                    self.scratch.push(b);
                    Ok(None)
                }
                b'>' if !self.scratch.is_empty() => self.close_element(),
                _ if is_space(b) && !self.scratch.is_empty() => {
                    self.state = State::AfterCloseTagName;
                    Ok(None)
                }
                _ => Err(self.unexpected(b)),
            },

            State::AfterCloseTagName => match b {
                _ if is_space(b) => Ok(None),
                b'>' => self.close_element(),
                _ => Err(self.unexpected(b)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn collect(input: &str) -> Result<Vec<XmlToken>, XmlError> {
        let mut tk = XmlTokenizer::new();
        tk.feed(input.as_bytes());
        let mut out = Vec::new();
        while let Some(tok) = tk.next_token()? {
            out.push(tok);
        }
        tk.done()?;
        Ok(out)
    }

    #[test]
    fn test_simple_element() {
        let toks = collect("<a>hello</a>").unwrap();
        assert_eq!(
            toks,
            vec![
                XmlToken::TagOpen("a".into()),
                XmlToken::TagClose,
                XmlToken::Text("hello".into()),
                XmlToken::ElementClose("a".into()),
            ]
        );
    }

    #[test]
    fn test_attributes() {
        let toks = collect(r#"<ppcp n="bob" p='9000'></ppcp>"#).unwrap();
        assert_eq!(
            toks,
            vec![
                XmlToken::TagOpen("ppcp".into()),
                XmlToken::AttrName("n".into()),
                XmlToken::AttrValue("bob".into()),
                XmlToken::AttrName("p".into()),
                XmlToken::AttrValue("9000".into()),
                XmlToken::TagClose,
                XmlToken::ElementClose("ppcp".into()),
            ]
        );
    }

    #[test]
    fn test_attribute_with_spaced_equals() {
        let toks = collect(r#"<a k = "v"></a>"#).unwrap();
        assert_eq!(
            toks,
            vec![
                XmlToken::TagOpen("a".into()),
                XmlToken::AttrName("k".into()),
                XmlToken::AttrValue("v".into()),
                XmlToken::TagClose,
                XmlToken::ElementClose("a".into()),
            ]
        );
    }

    #[test]
    fn test_nested_elements() {
        let toks = collect("<a><b>x</b>y</a>").unwrap();
        assert_eq!(
            toks,
            vec![
                XmlToken::TagOpen("a".into()),
                XmlToken::TagClose,
                XmlToken::TagOpen("b".into()),
                XmlToken::TagClose,
                XmlToken::Text("x".into()),
                XmlToken::ElementClose("b".into()),
                XmlToken::Text("y".into()),
                XmlToken::ElementClose("a".into()),
            ]
        );
    }

    #[test]
    fn test_entities_in_text_and_attr() {
        let toks = collect(r#"<m v="a&#38;b">1 &lt; 2</m>"#).unwrap();
        assert_eq!(
            toks,
            vec![
                XmlToken::TagOpen("m".into()),
                XmlToken::AttrName("v".into()),
                XmlToken::AttrValue("a&b".into()),
                XmlToken::TagClose,
                XmlToken::Text("1 < 2".into()),
                XmlToken::ElementClose("m".into()),
            ]
        );
    }

    #[test]
    fn test_mismatched_close_is_error() {
        let err = collect("<a><b></a></b>").unwrap_err();
        assert!(matches!(err, XmlError::MismatchedClose { .. }));
    }

    #[test]
    fn test_stray_close_is_error() {
        let mut tk = XmlTokenizer::new();
        tk.feed(b"<a></a></b>");
        let err = loop {
            match tk.next_token() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("expected a parse error"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, XmlError::UnexpectedClose(_)));
    }

    #[test]
    fn test_done_rejects_truncation() {
        let mut tk = XmlTokenizer::new();
        tk.feed(b"<a>partial");
        while tk.next_token().unwrap().is_some() {}
        assert!(matches!(tk.done(), Err(XmlError::TruncatedDocument(1))));
    }

    #[test]
    fn test_partial_resume_mid_entity() {
        let mut tk = XmlTokenizer::new();
        tk.feed(b"<a>x&am");
        assert_eq!(tk.next_token().unwrap(), Some(XmlToken::TagOpen("a".into())));
        assert_eq!(tk.next_token().unwrap(), Some(XmlToken::TagClose));
        assert_eq!(tk.next_token().unwrap(), None);
        tk.feed(b"p;y</a>");
        assert_eq!(tk.next_token().unwrap(), Some(XmlToken::Text("x&y".into())));
        assert_eq!(
            tk.next_token().unwrap(),
            Some(XmlToken::ElementClose("a".into()))
        );
        assert_eq!(tk.next_token().unwrap(), None);
        tk.done().unwrap();
    }

    #[test]
    fn test_leading_whitespace_skipped() {
        let toks = collect("  \r\n<a></a>").unwrap();
        assert_eq!(toks.len(), 3);
    }

    proptest! {
        // Feeding a document whole or split at arbitrary points yields the
        // same token sequence.
        #[test]
        fn prop_chunked_feed_equivalence(split in 0usize..64) {
            let doc = br#"<ppcp n="bob" p="9000"><st st="away" dn="Bob D.">brb &amp; afk</st><msg ac="1">waves</msg></ppcp>"#;
            let whole = {
                let mut tk = XmlTokenizer::new();
                tk.feed(doc);
                let mut out = Vec::new();
                while let Some(t) = tk.next_token().unwrap() { out.push(t); }
                tk.done().unwrap();
                out
            };
            let chunked = {
                let mut tk = XmlTokenizer::new();
                let mut out = Vec::new();
                let cut = split.min(doc.len());
                for part in [&doc[..cut], &doc[cut..]] {
                    tk.feed(part);
                    while let Some(t) = tk.next_token().unwrap() { out.push(t); }
                }
                tk.done().unwrap();
                out
            };
            prop_assert_eq!(whole, chunked);
        }

        #[test]
        fn prop_byte_at_a_time(chunk_len in 1usize..8) {
            let doc: &[u8] = br#"<a x="1&#38;2"> t&lt;t <b></b></a>"#;
            let whole = {
                let mut tk = XmlTokenizer::new();
                tk.feed(doc);
                let mut out = Vec::new();
                while let Some(t) = tk.next_token().unwrap() { out.push(t); }
                out
            };
            let mut tk = XmlTokenizer::new();
            let mut out = Vec::new();
            for part in doc.chunks(chunk_len) {
                tk.feed(part);
                while let Some(t) = tk.next_token().unwrap() { out.push(t); }
            }
            tk.done().unwrap();
            prop_assert_eq!(whole, out);
        }
    }
}
