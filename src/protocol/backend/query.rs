//! Result-set messages: RowDescription, DataRow, CommandComplete.

use std::mem::size_of;

use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::{Error, Result};
use crate::protocol::codec::{read_bytes, read_cstr, read_u16};
use crate::protocol::types::{FormatCode, I16BE, I32BE, Oid, U16BE, U32BE};

/// Fixed-size tail of a field description (18 bytes).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct FieldDescriptionTail {
    /// Table OID (0 if not a table column)
    pub table_oid: U32BE,
    /// Column attribute number (0 if not a table column)
    pub column_id: I16BE,
    /// Data type OID
    pub type_oid: U32BE,
    /// Type size (-1 for variable, -2 for null-terminated)
    pub type_size: I16BE,
    /// Type modifier
    pub type_modifier: I32BE,
    /// Format code (0=text, 1=binary)
    pub format: U16BE,
}

/// Field description within a RowDescription.
#[derive(Debug, Clone, Copy)]
pub struct FieldDescription<'a> {
    pub name: &'a str,
    pub tail: &'a FieldDescriptionTail,
}

impl FieldDescription<'_> {
    pub fn table_oid(&self) -> Oid {
        self.tail.table_oid.get()
    }

    pub fn column_id(&self) -> i16 {
        self.tail.column_id.get()
    }

    pub fn type_oid(&self) -> Oid {
        self.tail.type_oid.get()
    }

    pub fn type_size(&self) -> i16 {
        self.tail.type_size.get()
    }

    pub fn type_modifier(&self) -> i32 {
        self.tail.type_modifier.get()
    }

    pub fn format(&self) -> FormatCode {
        FormatCode::from_u16(self.tail.format.get())
    }
}

/// RowDescription message: the columns of the result set that follows.
#[derive(Debug)]
pub struct RowDescription<'a> {
    fields: Vec<FieldDescription<'a>>,
}

impl<'a> RowDescription<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        const TAIL_SIZE: usize = size_of::<FieldDescriptionTail>();

        let (num_fields, mut data) = read_u16(payload)?;
        let mut fields = Vec::with_capacity(num_fields as usize);
        for _ in 0..num_fields {
            let (name, rest) = read_cstr(data)?;
            let (tail, rest) = read_bytes(rest, TAIL_SIZE)?;
            let tail = FieldDescriptionTail::ref_from_bytes(tail)
                .map_err(|e| Error::Protocol(format!("FieldDescription tail: {e:?}")))?;
            fields.push(FieldDescription { name, tail });
            data = rest;
        }

        Ok(Self { fields })
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[FieldDescription<'a>] {
        &self.fields
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldDescription<'a>> {
        self.fields.iter()
    }
}

/// DataRow message: one row of column values.
#[derive(Debug, Clone, Copy)]
pub struct DataRow<'a> {
    num_columns: u16,
    columns_data: &'a [u8],
}

impl<'a> DataRow<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (num_columns, columns_data) = read_u16(payload)?;
        Ok(Self {
            num_columns,
            columns_data,
        })
    }

    pub fn len(&self) -> usize {
        self.num_columns as usize
    }

    pub fn is_empty(&self) -> bool {
        self.num_columns == 0
    }

    /// Iterate over column values; `None` is NULL.
    pub fn iter(&self) -> DataRowIter<'a> {
        DataRowIter {
            remaining: self.columns_data,
        }
    }

    /// Byte ranges of every column inside the payload, validated up front.
    ///
    /// The ranges are relative to the payload passed to [`DataRow::parse`].
    pub fn column_ranges(&self) -> Result<Vec<Option<std::ops::Range<usize>>>> {
        let mut ranges = Vec::with_capacity(self.len());
        let mut offset = 2;
        let mut data = self.columns_data;
        for _ in 0..self.num_columns {
            let Some((len, rest)) = data.split_first_chunk::<4>() else {
                return Err(Error::Protocol("DataRow: truncated column length".into()));
            };
            let len = i32::from_be_bytes(*len);
            offset += 4;
            if len < 0 {
                ranges.push(None);
                data = rest;
                continue;
            }
            let len = len as usize;
            if rest.len() < len {
                return Err(Error::Protocol(format!(
                    "DataRow: column of {} bytes exceeds the {} remaining",
                    len,
                    rest.len()
                )));
            }
            ranges.push(Some(offset..offset + len));
            offset += len;
            data = &rest[len..];
        }
        Ok(ranges)
    }
}

/// Iterator over column values in a DataRow.
#[derive(Debug, Clone)]
pub struct DataRowIter<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for DataRowIter<'a> {
    type Item = Option<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        let (len, rest) = self.remaining.split_first_chunk::<4>()?;
        let len = i32::from_be_bytes(*len);
        self.remaining = rest;
        if len == -1 {
            return Some(None);
        }
        let value;
        (value, self.remaining) = self.remaining.split_at_checked(len as usize)?;
        Some(Some(value))
    }
}

/// CommandComplete message.
#[derive(Debug, Clone, Copy)]
pub struct CommandComplete<'a> {
    /// Command tag, e.g. "SELECT 5", "INSERT 0 1"
    pub tag: &'a str,
}

impl<'a> CommandComplete<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (tag, _) = read_cstr(payload)?;
        Ok(Self { tag })
    }

    /// Rows affected, for tags that carry a count.
    pub fn rows_affected(&self) -> Result<Option<u64>> {
        parse_rows_affected(self.tag)
    }

    /// First word of the tag.
    pub fn command(&self) -> Option<&str> {
        self.tag.split_whitespace().next()
    }
}

/// Parse the row count out of a command tag.
///
/// A counted tag with a malformed count is a protocol error; other tags have no count.
pub fn parse_rows_affected(tag: &str) -> Result<Option<u64>> {
    let mut words = tag.split_whitespace();
    let count = match (words.next(), words.next(), words.next()) {
        (Some("INSERT"), Some(_oid), Some(count)) => count,
        (
            Some("SELECT" | "UPDATE" | "DELETE" | "FETCH" | "MOVE" | "COPY"),
            Some(count),
            None,
        ) => count,
        (Some("INSERT" | "SELECT" | "UPDATE" | "DELETE" | "FETCH" | "MOVE" | "COPY"), _, _) => {
            return Err(Error::Protocol(format!("malformed command tag: {tag:?}")));
        }
        _ => return Ok(None),
    };
    count
        .parse()
        .map(Some)
        .map_err(|_| Error::Protocol(format!("malformed command tag: {tag:?}")))
}
