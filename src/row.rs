//! Owned result rows and their column metadata.

use std::ops::Range;
use std::sync::Arc;

use crate::conversion::{FromRow, FromWireValue, Value, decode};
use crate::error::{Error, Result};
use crate::protocol::backend::{DataRow, FieldDescription, RowDescription};
use crate::protocol::types::{FormatCode, Oid};

/// One column of a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    name: String,
    table_oid: Oid,
    column_id: i16,
    type_oid: Oid,
    type_size: i16,
    type_modifier: i32,
    format: FormatCode,
}

impl Column {
    fn from_field(field: &FieldDescription<'_>) -> Self {
        Self {
            name: field.name.to_owned(),
            table_oid: field.table_oid(),
            column_id: field.column_id(),
            type_oid: field.type_oid(),
            type_size: field.type_size(),
            type_modifier: field.type_modifier(),
            format: field.format(),
        }
    }

    pub(crate) fn with_format(mut self, format: FormatCode) -> Self {
        self.format = format;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// OID of the source table, 0 for computed columns.
    pub fn table_oid(&self) -> Oid {
        self.table_oid
    }

    pub fn column_id(&self) -> i16 {
        self.column_id
    }

    pub fn type_oid(&self) -> Oid {
        self.type_oid
    }

    pub fn type_size(&self) -> i16 {
        self.type_size
    }

    pub fn type_modifier(&self) -> i32 {
        self.type_modifier
    }

    /// Format the values of this column arrive in.
    pub fn format(&self) -> FormatCode {
        self.format
    }
}

/// Copy the columns of a RowDescription out of the read buffer.
pub(crate) fn columns_from(desc: &RowDescription<'_>) -> Arc<[Column]> {
    desc.iter().map(Column::from_field).collect()
}

/// Identifies a column by position or by name.
pub trait ColumnIndex {
    fn index_in(&self, columns: &[Column]) -> Result<usize>;
}

impl ColumnIndex for usize {
    fn index_in(&self, columns: &[Column]) -> Result<usize> {
        if *self < columns.len() {
            Ok(*self)
        } else {
            Err(Error::InvalidUsage(format!(
                "column index {} out of range for {} columns",
                self,
                columns.len()
            )))
        }
    }
}

impl ColumnIndex for &str {
    fn index_in(&self, columns: &[Column]) -> Result<usize> {
        columns
            .iter()
            .position(|c| c.name == *self)
            .ok_or_else(|| Error::InvalidUsage(format!("no column named {:?}", self)))
    }
}

/// A result row. Owns a copy of the DataRow payload.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[Column]>,
    payload: Vec<u8>,
    ranges: Vec<Option<Range<usize>>>,
}

impl Row {
    pub(crate) fn new(columns: Arc<[Column]>, payload: &[u8]) -> Result<Self> {
        let data_row = DataRow::parse(payload)?;
        if data_row.len() != columns.len() {
            return Err(Error::Protocol(format!(
                "DataRow has {} columns, RowDescription has {}",
                data_row.len(),
                columns.len()
            )));
        }
        let ranges = data_row.column_ranges()?;
        Ok(Self {
            columns,
            payload: payload.to_vec(),
            ranges,
        })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Raw bytes of a column; `Ok(None)` is NULL.
    pub fn raw(&self, idx: impl ColumnIndex) -> Result<Option<&[u8]>> {
        let idx = idx.index_in(&self.columns)?;
        Ok(self.ranges[idx].clone().map(|r| &self.payload[r]))
    }

    /// True for NULL and for out-of-range indexes.
    pub fn is_null(&self, idx: usize) -> bool {
        !matches!(self.ranges.get(idx), Some(Some(_)))
    }

    /// Decode a column into `T`.
    pub fn get<'a, T: FromWireValue<'a>>(&'a self, idx: impl ColumnIndex) -> Result<T> {
        let idx = idx.index_in(&self.columns)?;
        let column = &self.columns[idx];
        match self.ranges[idx].clone() {
            None => T::from_null(),
            Some(r) => {
                let bytes = &self.payload[r];
                match column.format {
                    FormatCode::Text => T::from_text(column.type_oid, bytes),
                    FormatCode::Binary => T::from_binary(column.type_oid, bytes),
                }
            }
        }
    }

    /// Like [`Row::get`], with NULL as `None`.
    pub fn try_get<'a, T: FromWireValue<'a>>(&'a self, idx: impl ColumnIndex) -> Result<Option<T>> {
        self.get::<Option<T>>(idx)
    }

    pub fn get_by_name<'a, T: FromWireValue<'a>>(&'a self, name: &str) -> Result<T> {
        self.get(name)
    }

    /// Decode a column by its type OID.
    pub fn value(&self, idx: impl ColumnIndex) -> Result<Value> {
        let idx = idx.index_in(&self.columns)?;
        let column = &self.columns[idx];
        let bytes = self.ranges[idx].clone().map(|r| &self.payload[r]);
        decode(bytes, column.type_oid, column.format)
    }

    /// Every column as a [`Value`].
    pub fn values(&self) -> Result<Vec<Value>> {
        (0..self.len()).map(|i| self.value(i)).collect()
    }

    /// Decode the whole row, e.g. into a tuple.
    pub fn decode<'a, T: FromRow<'a>>(&'a self) -> Result<T> {
        T::from_row(self)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::types::oid;

    pub(crate) fn column(name: &str, type_oid: Oid, format: FormatCode) -> Column {
        Column {
            name: name.into(),
            table_oid: 0,
            column_id: 0,
            type_oid,
            type_size: -1,
            type_modifier: -1,
            format,
        }
    }

    pub(crate) fn data_row(values: &[Option<&[u8]>]) -> Vec<u8> {
        let mut payload = (values.len() as u16).to_be_bytes().to_vec();
        for value in values {
            match value {
                None => payload.extend_from_slice(&(-1_i32).to_be_bytes()),
                Some(v) => {
                    payload.extend_from_slice(&(v.len() as i32).to_be_bytes());
                    payload.extend_from_slice(v);
                }
            }
        }
        payload
    }

    fn sample() -> Row {
        let columns: Arc<[Column]> = vec![
            column("id", oid::INT4, FormatCode::Binary),
            column("name", oid::TEXT, FormatCode::Text),
            column("note", oid::TEXT, FormatCode::Text),
        ]
        .into();
        let payload = data_row(&[Some(&7_i32.to_be_bytes()[..]), Some(&b"seven"[..]), None]);
        Row::new(columns, &payload).unwrap()
    }

    #[test]
    fn test_get() {
        let row = sample();
        assert_eq!(row.len(), 3);
        assert_eq!(row.get::<i32>(0).unwrap(), 7);
        assert_eq!(row.get::<&str>(1).unwrap(), "seven");
        assert_eq!(row.get_by_name::<String>("name").unwrap(), "seven");
        assert_eq!(row.try_get::<String>(2).unwrap(), None);
        assert!(row.get::<String>(2).is_err());
        assert!(row.is_null(2));
        assert!(!row.is_null(0));
        assert!(matches!(row.get::<i32>(3), Err(Error::InvalidUsage(_))));
        assert!(matches!(row.get::<i32>("missing"), Err(Error::InvalidUsage(_))));
    }

    #[test]
    fn test_values() {
        let row = sample();
        assert_eq!(
            row.values().unwrap(),
            vec![Value::Int4(7), Value::Text("seven".into()), Value::Null]
        );
        assert_eq!(row.raw(1).unwrap(), Some(&b"seven"[..]));
    }

    #[test]
    fn test_column_count_mismatch() {
        let columns: Arc<[Column]> = vec![column("a", oid::TEXT, FormatCode::Text)].into();
        let payload = data_row(&[Some(&b"x"[..]), Some(&b"y"[..])]);
        assert!(matches!(Row::new(columns, &payload), Err(Error::Protocol(_))));
    }
}
