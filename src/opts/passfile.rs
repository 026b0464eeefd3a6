//! Password file (`.pgpass`) lookup.

use std::path::Path;

use tracing::debug;

/// Password of the first `host:port:db:user:password` line that matches.
///
/// `*` matches any value; `\:` and `\\` are escapes. An unreadable file
/// yields `None`.
pub fn passfile_password(path: &Path, host: &str, port: u16, db: &str, user: &str) -> Option<String> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            debug!("ignoring password file {}: {}", path.display(), e);
            return None;
        }
    };
    find_password(&contents, host, port, db, user)
}

fn find_password(contents: &str, host: &str, port: u16, db: &str, user: &str) -> Option<String> {
    let port = port.to_string();
    let wanted = [host, port.as_str(), db, user];
    contents
        .lines()
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .find_map(|line| {
            let fields = split_line(line)?;
            let matched = fields[..4]
                .iter()
                .zip(wanted)
                .all(|(field, value)| field == "*" || field == value);
            matched.then(|| fields[4].clone())
        })
}

/// Four fields up to an unescaped `:`, then the password as the remainder.
fn split_line(line: &str) -> Option<[String; 5]> {
    let mut fields: [String; 5] = Default::default();
    let mut idx = 0;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => fields[idx].push(chars.next().unwrap_or('\\')),
            ':' if idx < 4 => idx += 1,
            _ => fields[idx].push(c),
        }
    }
    (idx == 4).then_some(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = "\
# host:port:db:user:password
db1:5432:app:alice:first
*:*:*:bob:pa\\:ss
*:*:*:*:fallback
";

    #[test]
    fn test_first_match_wins() {
        assert_eq!(
            find_password(FILE, "db1", 5432, "app", "alice").as_deref(),
            Some("first")
        );
        assert_eq!(
            find_password(FILE, "db2", 5432, "app", "alice").as_deref(),
            Some("fallback")
        );
    }

    #[test]
    fn test_escapes() {
        assert_eq!(
            find_password(FILE, "any", 1, "x", "bob").as_deref(),
            Some("pa:ss")
        );
    }

    #[test]
    fn test_no_match() {
        assert_eq!(find_password("db1:5432:app:alice:pw\n", "db1", 5433, "app", "alice"), None);
        assert_eq!(find_password("short:line\n", "short", 5432, "line", "x"), None);
    }

    #[test]
    fn test_unreadable_file() {
        assert_eq!(
            passfile_password(Path::new("/nonexistent/.pgpass"), "h", 5432, "d", "u"),
            None
        );
    }
}
