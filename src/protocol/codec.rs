//! Wire encoding and decoding primitives.
//!
//! All integers are big-endian (network byte order). Readers return the
//! decoded value together with the unread rest of the input.

use crate::error::{Error, Result};
use zerocopy::FromBytes;

use super::types::{I16BE, I32BE, U16BE, U32BE};

/// Size of the frame header that follows the tag byte.
pub const LENGTH_SIZE: usize = 4;

/// Largest payload accepted from the server.
pub const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Read 1-byte unsigned integer.
#[inline]
pub fn read_u8(data: &[u8]) -> Result<(u8, &[u8])> {
    match data.split_first() {
        Some((&b, rest)) => Ok((b, rest)),
        None => Err(Error::Protocol("read_u8: empty buffer".into())),
    }
}

macro_rules! read_be {
    ($(#[$doc:meta])* $name:ident, $native:ty, $wrapper:ty, $len:literal) => {
        $(#[$doc])*
        #[inline]
        pub fn $name(data: &[u8]) -> Result<($native, &[u8])> {
            let Some((head, rest)) = data.split_at_checked($len) else {
                return Err(Error::Protocol(format!(
                    concat!(stringify!($name), ": buffer too short: {} < ", $len),
                    data.len()
                )));
            };
            let value = <$wrapper>::ref_from_bytes(head)
                .map_err(|e| Error::Protocol(format!(concat!(stringify!($name), ": {:?}"), e)))?
                .get();
            Ok((value, rest))
        }
    };
}

read_be!(
    /// Read 2-byte big-endian signed integer.
    read_i16, i16, I16BE, 2
);
read_be!(
    /// Read 2-byte big-endian unsigned integer.
    read_u16, u16, U16BE, 2
);
read_be!(
    /// Read 4-byte big-endian signed integer.
    read_i32, i32, I32BE, 4
);
read_be!(
    /// Read 4-byte big-endian unsigned integer.
    read_u32, u32, U32BE, 4
);

/// Read fixed-length bytes.
#[inline]
pub fn read_bytes(data: &[u8], len: usize) -> Result<(&[u8], &[u8])> {
    data.split_at_checked(len).ok_or_else(|| {
        Error::Protocol(format!(
            "read_bytes: buffer too short: {} < {}",
            data.len(),
            len
        ))
    })
}

/// Read a null-terminated string, returning the bytes without the terminator.
#[inline]
pub fn read_cstring(data: &[u8]) -> Result<(&[u8], &[u8])> {
    match memchr::memchr(0, data) {
        Some(pos) => Ok((&data[..pos], &data[pos + 1..])),
        None => Err(Error::Protocol(
            "read_cstring: no null terminator found".into(),
        )),
    }
}

/// Read null-terminated string as &str.
#[inline]
pub fn read_cstr(data: &[u8]) -> Result<(&str, &[u8])> {
    let (bytes, rest) = read_cstring(data)?;
    let s = simdutf8::compat::from_utf8(bytes)
        .map_err(|e| Error::Protocol(format!("read_cstr: invalid UTF-8: {e}")))?;
    Ok((s, rest))
}

/// Decode the length word of a frame header into a payload length.
pub fn payload_len(header: [u8; LENGTH_SIZE]) -> Result<usize> {
    let len = i32::from_be_bytes(header);
    if len < LENGTH_SIZE as i32 {
        return Err(Error::Protocol(format!("invalid message length: {len}")));
    }
    let len = len as usize - LENGTH_SIZE;
    if len > MAX_MESSAGE_LEN {
        return Err(Error::Protocol(format!("message too large: {len} bytes")));
    }
    Ok(len)
}

/// Write 1-byte unsigned integer.
#[inline]
pub fn write_u8(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

/// Write 2-byte big-endian signed integer.
#[inline]
pub fn write_i16(out: &mut Vec<u8>, value: i16) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Write 4-byte big-endian signed integer.
#[inline]
pub fn write_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Write null-terminated string.
#[inline]
pub fn write_cstr(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

/// Write an Int32 length placeholder and return its position for [`patch_len`].
#[inline]
pub fn reserve_len(out: &mut Vec<u8>) -> usize {
    let at = out.len();
    out.extend_from_slice(&[0, 0, 0, 0]);
    at
}

/// Fill a placeholder written by [`reserve_len`] with the number of bytes after it.
#[inline]
pub fn patch_len(out: &mut [u8], at: usize) {
    let len = (out.len() - at - LENGTH_SIZE) as i32;
    out[at..at + LENGTH_SIZE].copy_from_slice(&len.to_be_bytes());
}

/// Fill a message length placeholder; unlike [`patch_len`] the count includes the field itself.
#[inline]
pub fn patch_message_len(out: &mut [u8], at: usize) {
    let len = (out.len() - at) as i32;
    out[at..at + LENGTH_SIZE].copy_from_slice(&len.to_be_bytes());
}

/// Message builder that fills in the length field.
///
/// Message layout: type byte (not counted), Int32 length (counts itself), payload.
pub struct MessageBuilder<'a> {
    buf: &'a mut Vec<u8>,
    start: usize,
}

impl<'a> MessageBuilder<'a> {
    /// Start building a message with a type byte.
    pub fn new(buf: &'a mut Vec<u8>, type_byte: u8) -> Self {
        buf.push(type_byte);
        let start = reserve_len(buf);
        Self { buf, start }
    }

    /// Start building an untagged startup-phase packet.
    pub fn new_startup(buf: &'a mut Vec<u8>) -> Self {
        let start = reserve_len(buf);
        Self { buf, start }
    }

    /// Get mutable access to the underlying buffer.
    pub fn buf(&mut self) -> &mut Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        write_u8(self.buf, value);
    }

    pub fn write_i16(&mut self, value: i16) {
        write_i16(self.buf, value);
    }

    pub fn write_i32(&mut self, value: i32) {
        write_i32(self.buf, value);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn write_cstr(&mut self, s: &str) {
        write_cstr(self.buf, s);
    }

    /// Fill in the length field (which includes itself).
    pub fn finish(self) {
        patch_message_len(self.buf, self.start);
    }
}
