//! `key=value` connection strings.

use crate::error::{Error, Result};

use super::Settings;

/// Split a DSN into settings.
///
/// Whitespace separates pairs and may surround `=`. Values may be single
/// quoted; a backslash escapes the next character inside or outside quotes.
pub(crate) fn parse(input: &str) -> Result<Settings> {
    let mut settings = Settings::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
            key.push(c);
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.next_if_eq(&'=').is_none() {
            return Err(Error::config(&key, "missing \"=\" after key"));
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'\'').is_some() {
            loop {
                match chars.next() {
                    None => return Err(Error::config(&key, "unterminated quoted value")),
                    Some('\'') => break,
                    Some('\\') => match chars.next() {
                        Some(c) => value.push(c),
                        None => return Err(Error::config(&key, "dangling backslash")),
                    },
                    Some(c) => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                if c == '\\' {
                    match chars.next() {
                        Some(escaped) => value.push(escaped),
                        None => return Err(Error::config(&key, "dangling backslash")),
                    }
                } else {
                    value.push(c);
                }
            }
        }
        settings.insert(key, value);
    }
    Ok(settings)
}
