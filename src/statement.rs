//! Prepared statements and the sealed [`IntoStatement`] seam.

use std::sync::Arc;

use crate::protocol::types::{FormatCode, Oid, oid};
use crate::row::Column;

/// A statement parsed and described on the server.
///
/// Result formats are fixed when the statement is prepared: columns the
/// codec can decode in binary are requested in binary unless
/// `disable_prepared_binary_result` was set.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    name: String,
    param_oids: Vec<Oid>,
    columns: Arc<[Column]>,
    result_formats: Vec<u8>,
}

impl PreparedStatement {
    pub(crate) fn new(
        name: String,
        param_oids: Vec<Oid>,
        columns: Arc<[Column]>,
        disable_binary_result: bool,
    ) -> Self {
        let (columns, result_formats) = choose_result_formats(&columns, disable_binary_result);
        Self {
            name,
            param_oids,
            columns,
            result_formats,
        }
    }

    /// Server-side name; empty for the unnamed statement.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameter types the server inferred.
    pub fn param_oids(&self) -> &[Oid] {
        &self.param_oids
    }

    /// Result columns with the formats they will arrive in; empty when the
    /// statement returns no rows.
    pub fn columns(&self) -> &Arc<[Column]> {
        &self.columns
    }

    /// Encoded result-format section of Bind.
    pub(crate) fn result_formats(&self) -> &[u8] {
        &self.result_formats
    }
}

/// Pick a format per column and encode the Bind result-format section:
/// `[0,0]` for all text, `[0,1,0,1]` for all binary, otherwise one code per column.
pub(crate) fn choose_result_formats(
    columns: &[Column],
    disable_binary: bool,
) -> (Arc<[Column]>, Vec<u8>) {
    let formats: Vec<FormatCode> = columns
        .iter()
        .map(|c| {
            if !disable_binary && oid::has_binary_decoder(c.type_oid()) {
                FormatCode::Binary
            } else {
                FormatCode::Text
            }
        })
        .collect();

    let encoded = if formats.iter().all(|f| *f == FormatCode::Text) {
        vec![0, 0]
    } else if formats.iter().all(|f| *f == FormatCode::Binary) {
        vec![0, 1, 0, 1]
    } else {
        let mut out = Vec::with_capacity(2 + formats.len() * 2);
        out.extend_from_slice(&(formats.len() as i16).to_be_bytes());
        for f in &formats {
            out.extend_from_slice(&(*f as i16).to_be_bytes());
        }
        out
    };

    let columns = columns
        .iter()
        .zip(formats)
        .map(|(c, f)| c.clone().with_format(f))
        .collect();
    (columns, encoded)
}

/// SQL text or a prepared statement, accepted by the `query*`/`exec*` methods.
///
/// Sealed: implemented for `&str`, `&String` and `&PreparedStatement`.
pub trait IntoStatement: private::Sealed {
    /// SQL text that still needs a Parse message.
    fn as_sql(&self) -> Option<&str>;

    fn as_prepared(&self) -> Option<&PreparedStatement>;
}

mod private {
    pub trait Sealed {}

    impl Sealed for &super::PreparedStatement {}
    impl Sealed for &str {}
    impl Sealed for &String {}
}

impl IntoStatement for &PreparedStatement {
    fn as_sql(&self) -> Option<&str> {
        None
    }

    fn as_prepared(&self) -> Option<&PreparedStatement> {
        Some(self)
    }
}

impl IntoStatement for &str {
    fn as_sql(&self) -> Option<&str> {
        Some(self)
    }

    fn as_prepared(&self) -> Option<&PreparedStatement> {
        None
    }
}

impl IntoStatement for &String {
    fn as_sql(&self) -> Option<&str> {
        Some(self.as_str())
    }

    fn as_prepared(&self) -> Option<&PreparedStatement> {
        None
    }
}
