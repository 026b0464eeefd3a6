//! Quoting identifiers and literals for SQL built by hand.

/// Quote an identifier such as a table or column name.
///
/// Anything after a NUL byte is dropped, since the server cannot receive it.
pub fn quote_identifier(name: &str) -> String {
    let name = match memchr::memchr(0, name.as_bytes()) {
        Some(end) => &name[..end],
        None => name,
    };
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for c in name.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Quote a string literal.
///
/// A literal containing backslashes becomes an escape string (` E'...'`)
/// so it reads the same regardless of `standard_conforming_strings`.
pub fn quote_literal(literal: &str) -> String {
    let escaped = literal.replace('\'', "''");
    if escaped.contains('\\') {
        format!(" E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{}'", escaped)
    }
}
