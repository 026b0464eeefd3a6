//! `&str` and `String`.

use crate::error::{Error, Result};
use crate::protocol::types::{Oid, oid};

use super::{FromWireValue, ToWireValue, utf8};

/// Column types whose text form is handed out as a string without conversion.
fn is_textual(oid: Oid) -> bool {
    matches!(
        oid,
        oid::TEXT
            | oid::VARCHAR
            | oid::BPCHAR
            | oid::NAME
            | oid::CHAR
            | oid::JSON
            | oid::JSONB
            | oid::UNKNOWN
            | oid::NUMERIC
    )
}

impl<'a> FromWireValue<'a> for &'a str {
    fn from_text(oid: Oid, bytes: &'a [u8]) -> Result<Self> {
        if !is_textual(oid) {
            return Err(Error::Decode(format!("cannot decode oid {} as str", oid)));
        }
        utf8(bytes)
    }

    fn from_binary(oid: Oid, _bytes: &'a [u8]) -> Result<Self> {
        Err(Error::Decode(format!("cannot decode binary oid {} as str", oid)))
    }
}

impl FromWireValue<'_> for String {
    fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
        <&str>::from_text(oid, bytes).map(str::to_owned)
    }

    fn from_binary(oid: Oid, bytes: &[u8]) -> Result<Self> {
        <&str>::from_binary(oid, bytes).map(str::to_owned)
    }
}

impl ToWireValue for str {
    fn natural_oid(&self) -> Oid {
        oid::TEXT
    }

    fn write_text(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(self.as_bytes());
        Ok(())
    }
}

impl ToWireValue for String {
    fn natural_oid(&self) -> Oid {
        oid::TEXT
    }

    fn write_text(&self, buf: &mut Vec<u8>) -> Result<()> {
        self.as_str().write_text(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_text() {
        assert_eq!(String::from_text(oid::TEXT, b"hello").unwrap(), "hello");
        assert_eq!(<&str>::from_text(oid::NUMERIC, b"1.50").unwrap(), "1.50");
    }

    #[test]
    fn test_type_mismatch() {
        assert!(String::from_text(oid::INT4, b"1").is_err());
        assert!(String::from_text(oid::TEXT, &[0xff, 0xfe]).is_err());
    }
}
