//! Array text format: `{1,2,3}`, `{{"a",NULL},{"b","c"}}`.

use std::borrow::Cow;

use crate::error::{Error, Result};
use crate::protocol::types::{Oid, oid};

use super::{FromWireValue, ToWireValue, Value};

/// Raw elements of a parsed array literal; `None` is an unquoted `NULL`.
pub type ArrayElements<'a> = Vec<Option<Cow<'a, [u8]>>>;

fn unexpected(src: &[u8], i: usize) -> Error {
    Error::Decode(format!(
        "unable to parse array; unexpected {:?} at offset {}",
        src[i] as char, i
    ))
}

fn mismatched_dims() -> Error {
    Error::Decode("multidimensional arrays must have elements with matching dimensions".into())
}

fn expected(c: char, i: usize) -> Error {
    Error::Decode(format!(
        "unable to parse array; expected {:?} at offset {}",
        c, i
    ))
}

/// Split an array literal into its dimensions and raw elements.
///
/// Elements are separated by `delim` (`,` for everything except `box`).
/// Quoted elements have their backslash escapes removed. An empty array
/// has no dimensions.
pub fn parse_array<'a>(src: &'a [u8], delim: &[u8]) -> Result<(Vec<usize>, ArrayElements<'a>)> {
    if src.first() != Some(&b'{') {
        return Err(expected('{', 0));
    }

    let mut depth = 0;
    let mut i = 0;
    let mut dims = Vec::new();
    let mut elems: ArrayElements<'a> = Vec::new();

    let mut empty = false;
    while i < src.len() {
        match src[i] {
            b'{' => {
                depth += 1;
                i += 1;
            }
            b'}' => {
                empty = true;
                break;
            }
            _ => break,
        }
    }

    if !empty {
        dims = vec![0; depth];
        // Length of the first closed sub-array at each depth; siblings must match it.
        let mut shape: Vec<Option<usize>> = vec![None; depth];

        'next_element: loop {
            'element: while i < src.len() {
                match src[i] {
                    c if c != b'{' && depth < dims.len() => return Err(mismatched_dims()),
                    b'{' => {
                        if depth == dims.len() {
                            break 'element;
                        }
                        depth += 1;
                        dims[depth - 1] = 0;
                        i += 1;
                    }
                    b'"' => {
                        let mut elem = Vec::new();
                        let mut escape = false;
                        i += 1;
                        while i < src.len() {
                            let c = src[i];
                            if escape {
                                elem.push(c);
                                escape = false;
                            } else if c == b'\\' {
                                escape = true;
                            } else if c == b'"' {
                                elems.push(Some(Cow::Owned(elem)));
                                i += 1;
                                break 'element;
                            } else {
                                elem.push(c);
                            }
                            i += 1;
                        }
                    }
                    _ => {
                        let start = i;
                        while i < src.len() {
                            if src[i..].starts_with(delim) || src[i] == b'}' {
                                let elem = &src[start..i];
                                if elem.is_empty() {
                                    return Err(unexpected(src, i));
                                }
                                elems.push(if elem == b"NULL" {
                                    None
                                } else {
                                    Some(Cow::Borrowed(elem))
                                });
                                break 'element;
                            }
                            i += 1;
                        }
                    }
                }
            }

            while i < src.len() {
                if depth > 0 && src[i..].starts_with(delim) {
                    dims[depth - 1] += 1;
                    i += delim.len();
                    continue 'next_element;
                } else if depth > 0 && src[i] == b'}' {
                    dims[depth - 1] += 1;
                    let len = dims[depth - 1];
                    match shape[depth - 1] {
                        None => shape[depth - 1] = Some(len),
                        Some(first) if first != len => return Err(mismatched_dims()),
                        Some(_) => {}
                    }
                    depth -= 1;
                    i += 1;
                } else {
                    return Err(unexpected(src, i));
                }
            }
            break;
        }
    }

    while i < src.len() {
        if src[i] == b'}' && depth > 0 {
            depth -= 1;
            i += 1;
        } else {
            return Err(unexpected(src, i));
        }
    }
    if depth > 0 {
        return Err(expected('}', i));
    }
    if !dims.is_empty() && dims.iter().product::<usize>() != elems.len() {
        return Err(mismatched_dims());
    }
    Ok((dims, elems))
}

/// A decoded array: dimensions plus elements in row-major order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Array {
    dims: Vec<usize>,
    elements: Vec<Value>,
}

impl Array {
    /// One-dimensional array.
    pub fn new(elements: Vec<Value>) -> Self {
        let dims = if elements.is_empty() {
            Vec::new()
        } else {
            vec![elements.len()]
        };
        Self { dims, elements }
    }

    /// Multi-dimensional array; the product of `dims` must equal the element count.
    pub fn with_dims(dims: Vec<usize>, elements: Vec<Value>) -> Result<Self> {
        check_shape(&dims, &elements).map_err(Error::InvalidUsage)?;
        Ok(Self { dims, elements })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn elements(&self) -> &[Value] {
        &self.elements
    }

    pub fn into_elements(self) -> Vec<Value> {
        self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Decode the text form, converting each element as `elem_oid`.
    pub fn decode_text(elem_oid: Oid, src: &[u8]) -> Result<Self> {
        let (dims, raw) = parse_array(src, oid::array_delimiter(elem_oid))?;
        let elements = raw
            .iter()
            .map(|elem| match elem {
                None => Ok(Value::Null),
                Some(bytes) => Value::from_text(elem_oid, &**bytes),
            })
            .collect::<Result<Vec<_>>>()?;
        if check_shape(&dims, &elements).is_err() {
            return Err(mismatched_dims());
        }
        Ok(Self { dims, elements })
    }

    fn write_level(&self, buf: &mut Vec<u8>, level: usize, elements: &[Value]) -> Result<()> {
        buf.push(b'{');
        if level + 1 == self.dims.len() {
            for (i, elem) in elements.iter().enumerate() {
                if i > 0 {
                    buf.push(b',');
                }
                write_element(buf, elem)?;
            }
        } else {
            let stride = elements.len() / self.dims[level];
            for (i, chunk) in elements.chunks(stride).enumerate() {
                if i > 0 {
                    buf.push(b',');
                }
                self.write_level(buf, level + 1, chunk)?;
            }
        }
        buf.push(b'}');
        Ok(())
    }
}

fn check_shape(dims: &[usize], elements: &[Value]) -> std::result::Result<(), String> {
    let expected: usize = if dims.is_empty() { 0 } else { dims.iter().product() };
    if expected == elements.len() {
        Ok(())
    } else {
        Err(format!(
            "array dimensions {:?} do not match {} elements",
            dims,
            elements.len()
        ))
    }
}

fn write_element(buf: &mut Vec<u8>, elem: &Value) -> Result<()> {
    match elem {
        Value::Null => buf.extend_from_slice(b"NULL"),
        Value::Array(_) => {
            return Err(Error::Encode(
                "nested array element; use Array::with_dims for multiple dimensions".into(),
            ));
        }
        Value::Bool(_)
        | Value::Int2(_)
        | Value::Int4(_)
        | Value::Int8(_)
        | Value::Float4(_)
        | Value::Float8(_) => elem.write_text(buf)?,
        _ => {
            let mut text = Vec::new();
            elem.write_text(&mut text)?;
            buf.push(b'"');
            for &c in &text {
                if c == b'"' || c == b'\\' {
                    buf.push(b'\\');
                }
                buf.push(c);
            }
            buf.push(b'"');
        }
    }
    Ok(())
}

impl FromWireValue<'_> for Array {
    fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
        Self::decode_text(oid::array_element(oid).unwrap_or(oid::TEXT), bytes)
    }

    fn from_binary(oid: Oid, _bytes: &[u8]) -> Result<Self> {
        Err(Error::Unsupported(format!("binary format for oid {}", oid)))
    }
}

impl ToWireValue for Array {
    fn natural_oid(&self) -> Oid {
        self.elements
            .iter()
            .find(|v| !v.is_null())
            .and_then(|v| oid::array_of(v.natural_oid()))
            .unwrap_or(oid::TEXT_ARRAY)
    }

    fn write_text(&self, buf: &mut Vec<u8>) -> Result<()> {
        if self.elements.is_empty() {
            buf.extend_from_slice(b"{}");
            return Ok(());
        }
        self.write_level(buf, 0, &self.elements)
    }
}
