//! Common wire protocol types.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Object Identifier (OID)
pub type Oid = u32;

/// Type OIDs known to the value codec.
pub mod oid {
    use super::Oid;

    pub const BOOL: Oid = 16;
    pub const BYTEA: Oid = 17;
    pub const CHAR: Oid = 18;
    pub const NAME: Oid = 19;
    pub const INT8: Oid = 20;
    pub const INT2: Oid = 21;
    pub const INT4: Oid = 23;
    pub const TEXT: Oid = 25;
    pub const OID: Oid = 26;
    pub const JSON: Oid = 114;
    pub const BOX: Oid = 603;
    pub const FLOAT4: Oid = 700;
    pub const FLOAT8: Oid = 701;
    pub const UNKNOWN: Oid = 705;
    pub const BOOL_ARRAY: Oid = 1000;
    pub const BYTEA_ARRAY: Oid = 1001;
    pub const CHAR_ARRAY: Oid = 1002;
    pub const NAME_ARRAY: Oid = 1003;
    pub const INT2_ARRAY: Oid = 1005;
    pub const INT4_ARRAY: Oid = 1007;
    pub const TEXT_ARRAY: Oid = 1009;
    pub const BPCHAR_ARRAY: Oid = 1014;
    pub const VARCHAR_ARRAY: Oid = 1015;
    pub const INT8_ARRAY: Oid = 1016;
    pub const BOX_ARRAY: Oid = 1020;
    pub const FLOAT4_ARRAY: Oid = 1021;
    pub const FLOAT8_ARRAY: Oid = 1022;
    pub const BPCHAR: Oid = 1042;
    pub const VARCHAR: Oid = 1043;
    pub const DATE: Oid = 1082;
    pub const TIME: Oid = 1083;
    pub const TIMESTAMP: Oid = 1114;
    pub const TIMESTAMP_ARRAY: Oid = 1115;
    pub const DATE_ARRAY: Oid = 1182;
    pub const TIMESTAMPTZ: Oid = 1184;
    pub const TIMESTAMPTZ_ARRAY: Oid = 1185;
    pub const NUMERIC: Oid = 1700;
    pub const UUID: Oid = 2950;
    pub const UUID_ARRAY: Oid = 2951;
    pub const JSONB: Oid = 3802;

    /// Element type of an array type, if `array_oid` is one the codec knows.
    pub fn array_element(array_oid: Oid) -> Option<Oid> {
        let elem = match array_oid {
            BOOL_ARRAY => BOOL,
            BYTEA_ARRAY => BYTEA,
            CHAR_ARRAY => CHAR,
            NAME_ARRAY => NAME,
            INT2_ARRAY => INT2,
            INT4_ARRAY => INT4,
            INT8_ARRAY => INT8,
            TEXT_ARRAY => TEXT,
            BPCHAR_ARRAY => BPCHAR,
            VARCHAR_ARRAY => VARCHAR,
            BOX_ARRAY => BOX,
            FLOAT4_ARRAY => FLOAT4,
            FLOAT8_ARRAY => FLOAT8,
            TIMESTAMP_ARRAY => TIMESTAMP,
            TIMESTAMPTZ_ARRAY => TIMESTAMPTZ,
            DATE_ARRAY => DATE,
            UUID_ARRAY => UUID,
            _ => return None,
        };
        Some(elem)
    }

    /// Array type whose elements are `elem_oid`.
    pub fn array_of(elem_oid: Oid) -> Option<Oid> {
        let array = match elem_oid {
            BOOL => BOOL_ARRAY,
            BYTEA => BYTEA_ARRAY,
            INT2 => INT2_ARRAY,
            INT4 => INT4_ARRAY,
            INT8 => INT8_ARRAY,
            TEXT => TEXT_ARRAY,
            VARCHAR => VARCHAR_ARRAY,
            FLOAT4 => FLOAT4_ARRAY,
            FLOAT8 => FLOAT8_ARRAY,
            TIMESTAMP => TIMESTAMP_ARRAY,
            TIMESTAMPTZ => TIMESTAMPTZ_ARRAY,
            DATE => DATE_ARRAY,
            UUID => UUID_ARRAY,
            _ => return None,
        };
        Some(array)
    }

    /// Element delimiter in the array text format.
    pub fn array_delimiter(elem_oid: Oid) -> &'static [u8] {
        if elem_oid == BOX { b";" } else { b"," }
    }

    /// Types whose binary result format the codec decodes.
    pub fn has_binary_decoder(oid: Oid) -> bool {
        matches!(oid, BYTEA | INT8 | INT4 | INT2 | UUID)
    }
}

/// Data format code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum FormatCode {
    /// Text format (human-readable)
    #[default]
    Text = 0,
    /// Binary format (type-specific packed representation)
    Binary = 1,
}

impl FormatCode {
    /// Create a FormatCode from a raw u16 value; unknown codes read as text.
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => FormatCode::Binary,
            _ => FormatCode::Text,
        }
    }
}

impl From<u16> for FormatCode {
    fn from(value: u16) -> Self {
        Self::from_u16(value)
    }
}

/// Transaction status indicator from ReadyForQuery message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TransactionStatus {
    /// Idle (not in transaction block)
    #[default]
    Idle = b'I',
    /// In transaction block
    InTransaction = b'T',
    /// In failed transaction block (queries will be rejected until rollback)
    Failed = b'E',
}

impl TransactionStatus {
    /// Create a TransactionStatus from a raw byte value.
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            b'I' => Some(TransactionStatus::Idle),
            b'T' => Some(TransactionStatus::InTransaction),
            b'E' => Some(TransactionStatus::Failed),
            _ => None,
        }
    }

    /// Returns true if currently in a transaction (either active or failed).
    pub fn in_transaction(self) -> bool {
        matches!(self, TransactionStatus::InTransaction | TransactionStatus::Failed)
    }

    /// Returns true if the transaction has failed.
    pub fn is_failed(self) -> bool {
        matches!(self, TransactionStatus::Failed)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransactionStatus::Idle => "idle",
            TransactionStatus::InTransaction => "idle in transaction",
            TransactionStatus::Failed => "in a failed transaction",
        })
    }
}

macro_rules! big_endian {
    ($(#[$doc:meta])* $name:ident, $native:ty, $len:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
        #[repr(C)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const fn new(value: $native) -> Self {
                Self(value.to_be_bytes())
            }

            pub const fn get(self) -> $native {
                <$native>::from_be_bytes(self.0)
            }
        }

        impl From<$native> for $name {
            fn from(value: $native) -> Self {
                Self::new(value)
            }
        }
    };
}

big_endian!(
    /// Big-endian u16 for zerocopy.
    U16BE, u16, 2
);
big_endian!(
    /// Big-endian i16 for zerocopy.
    I16BE, i16, 2
);
big_endian!(
    /// Big-endian u32 for zerocopy.
    U32BE, u32, 4
);
big_endian!(
    /// Big-endian i32 for zerocopy.
    I32BE, i32, 4
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_status_bytes() {
        assert_eq!(TransactionStatus::from_byte(b'T'), Some(TransactionStatus::InTransaction));
        assert_eq!(TransactionStatus::from_byte(b'x'), None);
        assert!(TransactionStatus::Failed.in_transaction());
        assert_eq!(TransactionStatus::Failed.to_string(), "in a failed transaction");
    }

    #[test]
    fn test_array_oids() {
        assert_eq!(oid::array_element(oid::INT4_ARRAY), Some(oid::INT4));
        assert_eq!(oid::array_of(oid::TEXT), Some(oid::TEXT_ARRAY));
        assert_eq!(oid::array_delimiter(oid::BOX), b";");
        assert!(oid::has_binary_decoder(oid::UUID));
        assert!(!oid::has_binary_decoder(oid::TEXT));
    }

    #[test]
    fn test_big_endian_wrappers() {
        assert_eq!(I32BE::new(-2).get(), -2);
        assert_eq!(U16BE::new(0x0102).0, [1, 2]);
    }
}
