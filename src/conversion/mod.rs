//! Converting between Rust values and the wire representation of column values.
//!
//! Results come back as text except for the few types the extended protocol
//! asks for in binary (see [`crate::protocol::types::oid::has_binary_decoder`]). Parameters are sent
//! as text, with bytea optionally sent binary.

mod array;
mod bytes;
mod primitives;
mod row;
mod string;
pub mod timestamp;
mod uuid;
mod value;

pub use array::{Array, parse_array};
pub use row::FromRow;
pub use timestamp::{disable_infinity_ts, enable_infinity_ts};
pub use value::{Value, decode};

use crate::error::{Error, Result};
use crate::protocol::types::Oid;

/// Decoding a column value into a Rust type.
///
/// The OID lets implementations reject incompatible column types with a
/// clear error instead of misreading bytes.
pub trait FromWireValue<'a>: Sized {
    /// Decode SQL NULL. Fails unless the type can represent it (`Option<T>`, [`Value`]).
    fn from_null() -> Result<Self> {
        Err(Error::Decode("unexpected NULL value".into()))
    }

    /// Decode from text format bytes.
    fn from_text(oid: Oid, bytes: &'a [u8]) -> Result<Self>;

    /// Decode from binary format bytes.
    fn from_binary(oid: Oid, bytes: &'a [u8]) -> Result<Self>;
}

/// Encoding a Rust value as a statement parameter.
pub trait ToWireValue {
    /// The OID this value naturally encodes to.
    fn natural_oid(&self) -> Oid;

    /// Whether the value is SQL NULL; NULL is sent as length -1 with no body.
    fn is_null(&self) -> bool {
        false
    }

    /// Append the text representation.
    fn write_text(&self, buf: &mut Vec<u8>) -> Result<()>;

    /// Whether the value goes binary when binary parameters are enabled.
    fn prefers_binary(&self) -> bool {
        false
    }

    /// Append the binary representation.
    fn write_binary(&self, _buf: &mut Vec<u8>) -> Result<()> {
        Err(Error::Encode(format!(
            "no binary encoding for oid {}",
            self.natural_oid()
        )))
    }
}

/// A list of statement parameters.
pub trait ToParams {
    /// Number of parameters.
    fn param_count(&self) -> usize;

    /// Visit every parameter in order.
    fn for_each_param(
        &self,
        f: &mut dyn FnMut(&dyn ToWireValue) -> Result<()>,
    ) -> Result<()>;
}

pub(crate) fn utf8(bytes: &[u8]) -> Result<&str> {
    simdutf8::compat::from_utf8(bytes).map_err(|e| Error::Decode(format!("invalid UTF-8: {}", e)))
}

impl<'a, T: FromWireValue<'a>> FromWireValue<'a> for Option<T> {
    fn from_null() -> Result<Self> {
        Ok(None)
    }

    fn from_text(oid: Oid, bytes: &'a [u8]) -> Result<Self> {
        T::from_text(oid, bytes).map(Some)
    }

    fn from_binary(oid: Oid, bytes: &'a [u8]) -> Result<Self> {
        T::from_binary(oid, bytes).map(Some)
    }
}

impl<T: ToWireValue> ToWireValue for Option<T> {
    fn natural_oid(&self) -> Oid {
        match self {
            Some(v) => v.natural_oid(),
            None => 0,
        }
    }

    fn is_null(&self) -> bool {
        self.as_ref().is_none_or(ToWireValue::is_null)
    }

    fn write_text(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Some(v) => v.write_text(buf),
            None => Ok(()),
        }
    }

    fn prefers_binary(&self) -> bool {
        self.as_ref().is_some_and(ToWireValue::prefers_binary)
    }

    fn write_binary(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Some(v) => v.write_binary(buf),
            None => Ok(()),
        }
    }
}

impl<T: ToWireValue + ?Sized> ToWireValue for &T {
    fn natural_oid(&self) -> Oid {
        (**self).natural_oid()
    }

    fn is_null(&self) -> bool {
        (**self).is_null()
    }

    fn write_text(&self, buf: &mut Vec<u8>) -> Result<()> {
        (**self).write_text(buf)
    }

    fn prefers_binary(&self) -> bool {
        (**self).prefers_binary()
    }

    fn write_binary(&self, buf: &mut Vec<u8>) -> Result<()> {
        (**self).write_binary(buf)
    }
}

impl ToParams for () {
    fn param_count(&self) -> usize {
        0
    }

    fn for_each_param(
        &self,
        _f: &mut dyn FnMut(&dyn ToWireValue) -> Result<()>,
    ) -> Result<()> {
        Ok(())
    }
}

impl<T: ToParams + ?Sized> ToParams for &T {
    fn param_count(&self) -> usize {
        (**self).param_count()
    }

    fn for_each_param(
        &self,
        f: &mut dyn FnMut(&dyn ToWireValue) -> Result<()>,
    ) -> Result<()> {
        (**self).for_each_param(f)
    }
}

impl<T: ToWireValue> ToParams for [T] {
    fn param_count(&self) -> usize {
        self.len()
    }

    fn for_each_param(
        &self,
        f: &mut dyn FnMut(&dyn ToWireValue) -> Result<()>,
    ) -> Result<()> {
        self.iter().try_for_each(|v| f(v))
    }
}

impl<T: ToWireValue, const N: usize> ToParams for [T; N] {
    fn param_count(&self) -> usize {
        N
    }

    fn for_each_param(
        &self,
        f: &mut dyn FnMut(&dyn ToWireValue) -> Result<()>,
    ) -> Result<()> {
        self.as_slice().for_each_param(f)
    }
}

impl<T: ToWireValue> ToParams for Vec<T> {
    fn param_count(&self) -> usize {
        self.len()
    }

    fn for_each_param(
        &self,
        f: &mut dyn FnMut(&dyn ToWireValue) -> Result<()>,
    ) -> Result<()> {
        self.as_slice().for_each_param(f)
    }
}

macro_rules! impl_to_params {
    ($count:expr, $($idx:tt: $T:ident),+) => {
        impl<$($T: ToWireValue),+> ToParams for ($($T,)+) {
            fn param_count(&self) -> usize {
                $count
            }

            fn for_each_param(
                &self,
                f: &mut dyn FnMut(&dyn ToWireValue) -> Result<()>,
            ) -> Result<()> {
                $(f(&self.$idx)?;)+
                Ok(())
            }
        }
    };
}

impl_to_params!(1, 0: T0);
impl_to_params!(2, 0: T0, 1: T1);
impl_to_params!(3, 0: T0, 1: T1, 2: T2);
impl_to_params!(4, 0: T0, 1: T1, 2: T2, 3: T3);
impl_to_params!(5, 0: T0, 1: T1, 2: T2, 3: T3, 4: T4);
impl_to_params!(6, 0: T0, 1: T1, 2: T2, 3: T3, 4: T4, 5: T5);
impl_to_params!(7, 0: T0, 1: T1, 2: T2, 3: T3, 4: T4, 5: T5, 6: T6);
impl_to_params!(8, 0: T0, 1: T1, 2: T2, 3: T3, 4: T4, 5: T5, 6: T6, 7: T7);
impl_to_params!(9, 0: T0, 1: T1, 2: T2, 3: T3, 4: T4, 5: T5, 6: T6, 7: T7, 8: T8);
impl_to_params!(10, 0: T0, 1: T1, 2: T2, 3: T3, 4: T4, 5: T5, 6: T6, 7: T7, 8: T8, 9: T9);
impl_to_params!(11, 0: T0, 1: T1, 2: T2, 3: T3, 4: T4, 5: T5, 6: T6, 7: T7, 8: T8, 9: T9, 10: T10);
impl_to_params!(12, 0: T0, 1: T1, 2: T2, 3: T3, 4: T4, 5: T5, 6: T6, 7: T7, 8: T8, 9: T9, 10: T10, 11: T11);
