//! XML entity escaping and unescaping.
//!
//! Only the forms the wire protocol uses are recognized: `&lt;`, `&gt;`,
//! `&amp;`, and numeric references (`&#NNN;`, `&#xHH;`). Anything else is a
//! parse error. The output direction escapes `<`, `>`, `&`, `"`, `'` and NUL
//! as numeric entities.

use crate::error::XmlError;

/// Escape text for embedding in element content or attribute values.
///
/// Characters with markup meaning (and NUL) become numeric entities; all
/// other characters pass through unchanged.
pub fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '<' => out.push_str("&#60;"),
            '>' => out.push_str("&#62;"),
            '&' => out.push_str("&#38;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            '\0' => out.push_str("&#0;"),
            _ => out.push(c),
        }
    }
    out
}

/// Resolve one entity body (the text between `&` and `;`).
pub(crate) fn resolve_entity(body: &str) -> Result<char, XmlError> {
    match body {
        "lt" => return Ok('<'),
        "gt" => return Ok('>'),
        "amp" => return Ok('&'),
        _ => {}
    }

    let Some(num) = body.strip_prefix('#') else {
        return Err(XmlError::BadEntity(body.to_string()));
    };
    let value = if let Some(hex) = num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
        u32::from_str_radix(hex, 16)
    } else {
        num.parse::<u32>()
    }
    .map_err(|_| XmlError::BadEntity(body.to_string()))?;

    char::from_u32(value).ok_or(XmlError::CharOutOfRange(value))
}

/// Decode entity references in a complete run of text.
///
/// The input must contain whole entities; a dangling `&` with no terminating
/// `;` is a parse error (callers only invoke this on fully-delimited token
/// text, so truncation here means truncation on the wire).
pub fn unescape(input: &str) -> Result<String, XmlError> {
    if !input.contains('&') {
        return Ok(input.to_string());
    }
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let Some(end) = after.find(';') else {
            return Err(XmlError::BadEntity(after.to_string()));
        };
        out.push(resolve_entity(&after[..end])?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
