//! Connection service files (`pg_service.conf`).

use std::path::Path;

use crate::error::{Error, Result};

use super::Settings;

/// Settings of the `[name]` section, or `None` when there is no such section.
pub(crate) fn parse_section(contents: &str, name: &str) -> Result<Option<Settings>> {
    let mut current: Option<&str> = None;
    let mut found: Option<Settings> = None;

    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[') {
            let section = section
                .strip_suffix(']')
                .ok_or_else(|| Error::config(line, format!("malformed section header on line {}", lineno + 1)))?;
            current = Some(section.trim());
            if current == Some(name) && found.is_none() {
                found = Some(Settings::new());
            }
            continue;
        }
        if current != Some(name) {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| Error::config(line, format!("missing \"=\" on line {}", lineno + 1)))?;
        if let Some(settings) = found.as_mut() {
            settings.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(found)
}

/// Read `path` and return the settings of service `name`.
pub(crate) fn lookup(path: &Path, name: &str) -> Result<Settings> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        Error::config(&path.display().to_string(), format!("cannot read service file: {e}"))
    })?;
    parse_section(&contents, name)?
        .ok_or_else(|| Error::config(&format!("service={name}"), "definition of service not found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = "\
# comment
[main]
host = db1
port=5433
; other comment

[replica]
host=db2
";

    #[test]
    fn test_section() {
        let main = parse_section(FILE, "main").unwrap().unwrap();
        assert_eq!(main["host"], "db1");
        assert_eq!(main["port"], "5433");
        assert_eq!(main.len(), 2);

        let replica = parse_section(FILE, "replica").unwrap().unwrap();
        assert_eq!(replica["host"], "db2");
        assert!(parse_section(FILE, "missing").unwrap().is_none());
    }

    #[test]
    fn test_malformed() {
        assert!(parse_section("[main]\nhost db1\n", "main").is_err());
        assert!(parse_section("[main\n", "main").is_err());
    }

    #[test]
    fn test_unreadable_file() {
        let err = lookup(Path::new("/nonexistent/pg_service.conf"), "main").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
