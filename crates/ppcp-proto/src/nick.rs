//! Nick canonicalization and validation.
//!
//! A nick is the protocol-level identifier derived from a display name by a
//! canonicalization function: ASCII letters are lower-cased and every code
//! point below `'0'` (value 48) is replaced with `_`. A display name
//! "matches" a nick when canonicalizing the name reproduces the nick exactly.

/// Maximum accepted nick length in bytes.
pub const MAX_NICK_LEN: usize = 64;

/// Canonicalize a single character.
///
/// Maps:
/// - anything below `'0'` (spaces, punctuation, control characters) → `_`
/// - `A`-`Z` → `a`-`z`
/// - everything else unchanged
#[inline]
pub const fn nick_char(c: char) -> char {
    match c {
        '\0'..='/' => '_',
        'A'..='Z' => (c as u8 + 32) as char,
        _ => c,
    }
}

/// Derive a nick from a display name.
///
/// Idempotent: `nick_from_name(&nick_from_name(s)) == nick_from_name(s)`.
///
/// # Examples
///
/// ```
/// use ppcp_proto::nick::nick_from_name;
///
/// assert_eq!(nick_from_name("Bob Dobbs"), "bob_dobbs");
/// assert_eq!(nick_from_name("J.R. \"Bob\""), "j_r___bob_");
/// ```
pub fn nick_from_name(name: &str) -> String {
    name.chars().map(nick_char).collect()
}

/// Check whether a display name canonicalizes to the given nick.
pub fn name_matches_nick(name: &str, nick: &str) -> bool {
    if name.len() != nick.len() {
        return false;
    }
    name.chars()
        .zip(nick.chars())
        .all(|(cn, ck)| nick_char(cn) == ck)
}

/// Check whether a string is a syntactically valid nick.
///
/// A valid nick is non-empty, at most [`MAX_NICK_LEN`] bytes, and already in
/// canonical form (a fixed point of [`nick_from_name`]).
pub fn is_valid_nick(s: &str) -> bool {
    !s.is_empty() && s.len() <= MAX_NICK_LEN && s.chars().all(|c| nick_char(c) == c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_nick_char() {
        assert_eq!(nick_char('A'), 'a');
        assert_eq!(nick_char('Z'), 'z');
        assert_eq!(nick_char('a'), 'a');
        assert_eq!(nick_char('0'), '0');
        assert_eq!(nick_char(' '), '_');
        assert_eq!(nick_char('!'), '_');
        assert_eq!(nick_char('\n'), '_');
        assert_eq!(nick_char('\0'), '_');
        assert_eq!(nick_char('~'), '~');
        assert_eq!(nick_char('é'), 'é');
    }

    #[test]
    fn test_nick_from_name() {
        assert_eq!(nick_from_name("Bob Dobbs"), "bob_dobbs");
        assert_eq!(nick_from_name("alice"), "alice");
        assert_eq!(nick_from_name("C-3PO"), "c_3po");
        assert_eq!(nick_from_name(""), "");
    }

    #[test]
    fn test_name_matches_nick() {
        assert!(name_matches_nick("Bob Dobbs", "bob_dobbs"));
        assert!(name_matches_nick("alice", "alice"));
        assert!(!name_matches_nick("Bob", "bob_dobbs"));
        assert!(!name_matches_nick("Bob Dobbs", "bob-dobbs"));
    }

    #[test]
    fn test_is_valid_nick() {
        assert!(is_valid_nick("bob_dobbs"));
        assert!(is_valid_nick("x"));
        assert!(!is_valid_nick(""));
        assert!(!is_valid_nick("Bob"));
        assert!(!is_valid_nick("bob dobbs"));
        assert!(!is_valid_nick(&"a".repeat(MAX_NICK_LEN + 1)));
    }

    proptest! {
        #[test]
        fn prop_nick_from_name_idempotent(name in ".{0,64}") {
            let once = nick_from_name(&name);
            prop_assert_eq!(nick_from_name(&once), once.clone());
        }

        #[test]
        fn prop_match_iff_canonical(name in ".{0,32}") {
            let nick = nick_from_name(&name);
            prop_assert!(name_matches_nick(&name, &nick));
        }

        // For equal-length pairs, matching is exactly canonical equality.
        #[test]
        fn prop_match_agrees_with_derivation(name in "[ -~]{1,16}", nick in "[ -~]{1,16}") {
            prop_assert_eq!(
                name_matches_nick(&name, &nick),
                nick_from_name(&name) == nick
            );
        }
    }
}
