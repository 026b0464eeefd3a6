//! uuid::Uuid, text and binary.

use crate::error::{Error, Result};
use crate::protocol::types::{Oid, oid};

use super::{FromWireValue, ToWireValue, utf8};

impl FromWireValue<'_> for uuid::Uuid {
    fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
        if oid != oid::UUID {
            return Err(Error::Decode(format!("cannot decode oid {} as UUID", oid)));
        }
        uuid::Uuid::parse_str(utf8(bytes)?)
            .map_err(|e| Error::Decode(format!("invalid UUID: {}", e)))
    }

    fn from_binary(oid: Oid, bytes: &[u8]) -> Result<Self> {
        if oid != oid::UUID {
            return Err(Error::Decode(format!("cannot decode oid {} as UUID", oid)));
        }
        uuid::Uuid::from_slice(bytes).map_err(|e| Error::Decode(format!("invalid UUID: {}", e)))
    }
}

impl ToWireValue for uuid::Uuid {
    fn natural_oid(&self) -> Oid {
        oid::UUID
    }

    fn write_text(&self, buf: &mut Vec<u8>) -> Result<()> {
        let mut scratch = uuid::Uuid::encode_buffer();
        buf.extend_from_slice(self.hyphenated().encode_lower(&mut scratch).as_bytes());
        Ok(())
    }
}
