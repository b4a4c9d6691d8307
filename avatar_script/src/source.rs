//! Comment stripping applied to script source before it is persisted.

use std::sync::OnceLock;

use regex::Regex;

fn whitespace_run() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\s+").expect("whitespace pattern compiles"))
}

/// Removes line and block comments and collapses whitespace outside string
/// literals to single spaces. Stripping an already stripped source is a no-op.
pub fn strip_comments(source: &str) -> String {
    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len());
    let mut pending = String::new();
    let mut run_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                pending.push_str(&source[run_start..i]);
                let body = i + 2;
                i = match long_bracket(bytes, body) {
                    Some((level, open_end)) => close_long_bracket(bytes, open_end, level),
                    None => line_end(bytes, body),
                };
                pending.push(' ');
                run_start = i;
            }
            b'"' | b'\'' => {
                pending.push_str(&source[run_start..i]);
                flush_code(&mut out, &mut pending);
                let end = quoted_end(bytes, i);
                out.push_str(&source[i..end]);
                i = end;
                run_start = i;
            }
            b'[' => match long_bracket(bytes, i) {
                Some((level, open_end)) => {
                    pending.push_str(&source[run_start..i]);
                    flush_code(&mut out, &mut pending);
                    let end = close_long_bracket(bytes, open_end, level);
                    out.push_str(&source[i..end]);
                    i = end;
                    run_start = i;
                }
                None => i += 1,
            },
            _ => i += 1,
        }
    }
    pending.push_str(&source[run_start..]);
    flush_code(&mut out, &mut pending);

    out.trim().to_string()
}

fn flush_code(out: &mut String, pending: &mut String) {
    if pending.is_empty() {
        return;
    }
    out.push_str(&whitespace_run().replace_all(pending, " "));
    pending.clear();
}

/// Recognises `[`, `=`*, `[` at `start`, returning the level and the index after the opener.
fn long_bracket(bytes: &[u8], start: usize) -> Option<(usize, usize)> {
    if bytes.get(start) != Some(&b'[') {
        return None;
    }
    let mut cursor = start + 1;
    while bytes.get(cursor) == Some(&b'=') {
        cursor += 1;
    }
    (bytes.get(cursor) == Some(&b'[')).then_some((cursor - start - 1, cursor + 1))
}

/// Index just past the `]`, `=`*level, `]` closer, or the end of input when unterminated.
fn close_long_bracket(bytes: &[u8], from: usize, level: usize) -> usize {
    let mut i = from;
    while i < bytes.len() {
        if bytes[i] == b']' {
            let equals = bytes[i + 1..].iter().take_while(|b| **b == b'=').count();
            let close = i + 1 + equals;
            if equals == level && bytes.get(close) == Some(&b']') {
                return close + 1;
            }
        }
        i += 1;
    }
    bytes.len()
}

/// Index of the newline ending a line comment (kept as code) or the end of input.
fn line_end(bytes: &[u8], from: usize) -> usize {
    bytes[from..]
        .iter()
        .position(|b| *b == b'\n')
        .map_or(bytes.len(), |offset| from + offset)
}

/// Index just past the closing quote of the literal opened at `start`. An
/// unterminated literal ends after its newline, which is kept verbatim.
fn quoted_end(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' => return i + 1,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}
