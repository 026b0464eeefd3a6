//! bool, integers and floats.

use std::fmt::Write as _;

use crate::error::{Error, Result};
use crate::protocol::types::{Oid, oid};

use super::{FromWireValue, ToWireValue, utf8};

fn mismatch(oid: Oid, target: &str) -> Error {
    Error::Decode(format!("cannot decode oid {} as {}", oid, target))
}

fn write_display(buf: &mut Vec<u8>, value: impl std::fmt::Display) {
    let mut s = String::new();
    let _ = write!(s, "{value}");
    buf.extend_from_slice(s.as_bytes());
}

// === Boolean ===

pub(crate) fn parse_bool(bytes: &[u8]) -> Result<bool> {
    match bytes {
        b"t" | b"true" | b"TRUE" | b"T" | b"1" => Ok(true),
        b"f" | b"false" | b"FALSE" | b"F" | b"0" => Ok(false),
        _ => Err(Error::Decode(format!(
            "invalid boolean: {:?}",
            String::from_utf8_lossy(bytes)
        ))),
    }
}

impl FromWireValue<'_> for bool {
    fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
        if oid != oid::BOOL {
            return Err(mismatch(oid, "bool"));
        }
        parse_bool(bytes)
    }

    fn from_binary(oid: Oid, bytes: &[u8]) -> Result<Self> {
        if oid != oid::BOOL {
            return Err(mismatch(oid, "bool"));
        }
        match bytes {
            [b] => Ok(*b != 0),
            _ => Err(Error::Decode(format!("invalid boolean length: {}", bytes.len()))),
        }
    }
}

impl ToWireValue for bool {
    fn natural_oid(&self) -> Oid {
        oid::BOOL
    }

    fn write_text(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(if *self { b"true" } else { b"false" });
        Ok(())
    }
}

// === Integers ===

/// Read a big-endian integer of 2, 4 or 8 bytes, widening to i64.
pub(crate) fn read_binary_int(oid: Oid, bytes: &[u8]) -> Result<i64> {
    let value = match (oid, bytes.len()) {
        (oid::INT2, 2) => i64::from(i16::from_be_bytes([bytes[0], bytes[1]])),
        (oid::INT4, 4) => i64::from(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        (oid::INT8, 8) => {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(bytes);
            i64::from_be_bytes(arr)
        }
        (oid::INT2 | oid::INT4 | oid::INT8, len) => {
            return Err(Error::Decode(format!(
                "invalid length {} for integer oid {}",
                len, oid
            )));
        }
        _ => return Err(mismatch(oid, "integer")),
    };
    Ok(value)
}

macro_rules! impl_int {
    ($t:ty, $natural:expr, [$($accept:path),+]) => {
        impl FromWireValue<'_> for $t {
            fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
                if !matches!(oid, $($accept)|+) {
                    return Err(mismatch(oid, stringify!($t)));
                }
                utf8(bytes)?
                    .parse()
                    .map_err(|e| Error::Decode(format!(concat!("invalid ", stringify!($t), ": {}"), e)))
            }

            fn from_binary(oid: Oid, bytes: &[u8]) -> Result<Self> {
                if !matches!(oid, $($accept)|+) {
                    return Err(mismatch(oid, stringify!($t)));
                }
                let wide = read_binary_int(oid, bytes)?;
                <$t>::try_from(wide).map_err(|_| {
                    Error::Decode(format!(concat!("{} out of range for ", stringify!($t)), wide))
                })
            }
        }

        impl ToWireValue for $t {
            fn natural_oid(&self) -> Oid {
                $natural
            }

            fn write_text(&self, buf: &mut Vec<u8>) -> Result<()> {
                write_display(buf, self);
                Ok(())
            }
        }
    };
}

impl_int!(i16, oid::INT2, [oid::INT2]);
impl_int!(i32, oid::INT4, [oid::INT2, oid::INT4]);
impl_int!(i64, oid::INT8, [oid::INT2, oid::INT4, oid::INT8]);

impl FromWireValue<'_> for u32 {
    fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
        if oid != oid::OID {
            return Err(mismatch(oid, "u32"));
        }
        utf8(bytes)?
            .parse()
            .map_err(|e| Error::Decode(format!("invalid oid: {}", e)))
    }

    fn from_binary(oid: Oid, bytes: &[u8]) -> Result<Self> {
        if oid != oid::OID {
            return Err(mismatch(oid, "u32"));
        }
        let arr: [u8; 4] = bytes
            .try_into()
            .map_err(|_| Error::Decode(format!("invalid oid length: {}", bytes.len())))?;
        Ok(u32::from_be_bytes(arr))
    }
}

// === Floats ===

macro_rules! impl_float {
    ($t:ty, $natural:expr) => {
        impl FromWireValue<'_> for $t {
            fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
                if !matches!(oid, oid::FLOAT4 | oid::FLOAT8) {
                    return Err(mismatch(oid, stringify!($t)));
                }
                match bytes {
                    b"NaN" => Ok(<$t>::NAN),
                    b"Infinity" => Ok(<$t>::INFINITY),
                    b"-Infinity" => Ok(<$t>::NEG_INFINITY),
                    _ => utf8(bytes)?.parse().map_err(|e| {
                        Error::Decode(format!(concat!("invalid ", stringify!($t), ": {}"), e))
                    }),
                }
            }

            fn from_binary(oid: Oid, _bytes: &[u8]) -> Result<Self> {
                Err(Error::Unsupported(format!(
                    "binary format for oid {}",
                    oid
                )))
            }
        }

        impl ToWireValue for $t {
            fn natural_oid(&self) -> Oid {
                $natural
            }

            fn write_text(&self, buf: &mut Vec<u8>) -> Result<()> {
                if self.is_nan() {
                    buf.extend_from_slice(b"NaN");
                } else if self.is_infinite() {
                    buf.extend_from_slice(if self.is_sign_negative() {
                        b"-Infinity"
                    } else {
                        b"Infinity"
                    });
                } else {
                    write_display(buf, self);
                }
                Ok(())
            }
        }
    };
}

impl_float!(f32, oid::FLOAT4);
impl_float!(f64, oid::FLOAT8);
