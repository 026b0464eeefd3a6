//! `Vec<u8>` and `&[u8]` for bytea.

use crate::error::{Error, Result};
use crate::protocol::types::{Oid, oid};

use super::{FromWireValue, ToWireValue};

/// Decode the text form of bytea: `\x` hex, or the legacy escape format.
pub(crate) fn decode_bytea_text(bytes: &[u8]) -> Result<Vec<u8>> {
    match bytes.strip_prefix(b"\\x") {
        Some(digits) => decode_hex(digits),
        None => decode_escape(bytes),
    }
}

/// Append `\x` followed by lowercase hex.
pub(crate) fn encode_bytea_text(bytes: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(b"\\x");
    buf.extend_from_slice(hex::encode(bytes).as_bytes());
}

fn decode_hex(digits: &[u8]) -> Result<Vec<u8>> {
    hex::decode(digits).map_err(|e| Error::Decode(format!("invalid hex in bytea: {e}")))
}

/// `\\` is a backslash, `\ooo` an octal byte, everything else is literal.
fn decode_escape(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut rest = bytes;
    while let Some((&b, tail)) = rest.split_first() {
        if b != b'\\' {
            out.push(b);
            rest = tail;
            continue;
        }
        match tail {
            [b'\\', more @ ..] => {
                out.push(b'\\');
                rest = more;
            }
            [d1 @ b'0'..=b'3', d2 @ b'0'..=b'7', d3 @ b'0'..=b'7', more @ ..] => {
                out.push(((d1 - b'0') << 6) | ((d2 - b'0') << 3) | (d3 - b'0'));
                rest = more;
            }
            _ => return Err(Error::Decode("invalid bytea escape sequence".into())),
        }
    }
    Ok(out)
}

impl FromWireValue<'_> for Vec<u8> {
    fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
        if oid != oid::BYTEA {
            return Err(Error::Decode(format!("cannot decode oid {} as bytes", oid)));
        }
        decode_bytea_text(bytes)
    }

    fn from_binary(oid: Oid, bytes: &[u8]) -> Result<Self> {
        <&[u8]>::from_binary(oid, bytes).map(<[u8]>::to_vec)
    }
}

/// Borrowed bytes only exist in binary format, where no unescaping is needed.
impl<'a> FromWireValue<'a> for &'a [u8] {
    fn from_text(oid: Oid, _bytes: &'a [u8]) -> Result<Self> {
        Err(Error::Decode(format!(
            "cannot borrow text-format oid {} as bytes, decode into Vec<u8>",
            oid
        )))
    }

    fn from_binary(oid: Oid, bytes: &'a [u8]) -> Result<Self> {
        if oid != oid::BYTEA {
            return Err(Error::Decode(format!("cannot decode oid {} as bytes", oid)));
        }
        Ok(bytes)
    }
}

impl ToWireValue for [u8] {
    fn natural_oid(&self) -> Oid {
        oid::BYTEA
    }

    fn write_text(&self, buf: &mut Vec<u8>) -> Result<()> {
        encode_bytea_text(self, buf);
        Ok(())
    }

    fn prefers_binary(&self) -> bool {
        true
    }

    fn write_binary(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl ToWireValue for Vec<u8> {
    fn natural_oid(&self) -> Oid {
        oid::BYTEA
    }

    fn write_text(&self, buf: &mut Vec<u8>) -> Result<()> {
        self.as_slice().write_text(buf)
    }

    fn prefers_binary(&self) -> bool {
        true
    }

    fn write_binary(&self, buf: &mut Vec<u8>) -> Result<()> {
        self.as_slice().write_binary(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytea_hex() {
        assert_eq!(
            Vec::<u8>::from_text(oid::BYTEA, b"\\xDEADbeef").unwrap(),
            vec![0xde, 0xad, 0xbe, 0xef]
        );
        assert!(Vec::<u8>::from_text(oid::BYTEA, b"\\xabc").is_err());
    }

    #[test]
    fn test_bytea_escape_format() {
        assert_eq!(
            decode_bytea_text(b"a\\\\b\\000\\377").unwrap(),
            vec![b'a', b'\\', b'b', 0, 0xff]
        );
        assert!(decode_bytea_text(b"bad\\9").is_err());
    }

    #[test]
    fn test_bytea_encode() {
        let mut buf = Vec::new();
        vec![0x00_u8, 0x1f, 0xa0].write_text(&mut buf).unwrap();
        assert_eq!(buf, b"\\x001fa0");

        buf.clear();
        b"raw".as_slice().write_binary(&mut buf).unwrap();
        assert_eq!(buf, b"raw");
    }
}
