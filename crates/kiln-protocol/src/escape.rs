//! Escaping of payload lines.
//!
//! Payload text may contain anything, including line breaks and verbatim
//! sentinel strings. Each payload line is escaped so that it holds no line
//! break and never starts with `----`:
//!
//! - `\` is written as `\\`
//! - LF is written as `\n` and CR as `\r`
//! - a leading `-` of an escaped line starting with `----` is written as `\-`
//!
//! [`unescape`] reverses the transformation; unknown escapes decode to the
//! escaped character itself.

const SENTINEL_PREFIX: &str = "----";

/// Escapes a single payload value into one wire line.
#[must_use]
pub fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 1);
    if value.starts_with(SENTINEL_PREFIX) {
        escaped.push('\\');
    }
    for character in value.chars() {
        match character {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Decodes a wire line produced by [`escape`].
#[must_use]
pub fn unescape(line: &str) -> String {
    let mut value = String::with_capacity(line.len());
    let mut characters = line.chars();
    while let Some(character) = characters.next() {
        if character != '\\' {
            value.push(character);
            continue;
        }
        match characters.next() {
            Some('n') => value.push('\n'),
            Some('r') => value.push('\r'),
            Some(other) => value.push(other),
            None => value.push('\\'),
        }
    }
    value
}

/// Splits multi-line text into escaped wire lines.
///
/// The text is split on every LF so that [`join_lines`] restores it exactly,
/// including a trailing line break.
pub fn text_lines(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split('\n').map(escape)
}

/// Rejoins wire lines produced by [`text_lines`].
#[must_use]
pub fn join_lines(lines: &[String]) -> String {
    lines
        .iter()
        .map(|line| unescape(line))
        .collect::<Vec<_>>()
        .join("\n")
}
