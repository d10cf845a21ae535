//! Incremental XML tokenizing and entity escaping.

pub mod escape;
pub mod tokenizer;

pub use escape::{escape, unescape};
pub use tokenizer::{XmlToken, XmlTokenizer};
