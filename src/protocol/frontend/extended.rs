//! Extended query protocol messages.

use crate::conversion::{ToParams, ToWireValue};
use crate::error::Result;
use crate::protocol::codec::{MessageBuilder, patch_len, reserve_len};
use crate::protocol::types::{FormatCode, Oid};

/// Write a Parse message.
///
/// `param_oids` may be empty to let the server infer every parameter type.
pub fn write_parse(buf: &mut Vec<u8>, name: &str, query: &str, param_oids: &[Oid]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PARSE);
    msg.write_cstr(name);
    msg.write_cstr(query);
    msg.write_i16(param_oids.len() as i16);
    for &oid in param_oids {
        msg.write_i32(oid as i32);
    }
    msg.finish();
}

/// Write a Bind message.
///
/// Parameters travel as text unless `binary_params` is set, in which case
/// values that prefer it (bytea) are sent binary. `result_formats` is the
/// already encoded result-format section: count followed by codes.
pub fn write_bind<P: ToParams + ?Sized>(
    buf: &mut Vec<u8>,
    portal: &str,
    statement: &str,
    params: &P,
    binary_params: bool,
    result_formats: &[u8],
) -> Result<()> {
    let count = params.param_count() as i16;
    let mut msg = MessageBuilder::new(buf, super::msg_type::BIND);
    msg.write_cstr(portal);
    msg.write_cstr(statement);

    if binary_params {
        msg.write_i16(count);
        params.for_each_param(&mut |value| {
            let code = if value.prefers_binary() {
                FormatCode::Binary
            } else {
                FormatCode::Text
            };
            msg.write_i16(code as i16);
            Ok(())
        })?;
    } else {
        // zero format codes: all parameters are text
        msg.write_i16(0);
    }

    msg.write_i16(count);
    params.for_each_param(&mut |value| write_param(msg.buf(), value, binary_params))?;

    msg.write_bytes(result_formats);
    msg.finish();
    Ok(())
}

fn write_param(buf: &mut Vec<u8>, value: &dyn ToWireValue, binary_params: bool) -> Result<()> {
    if value.is_null() {
        buf.extend_from_slice(&(-1_i32).to_be_bytes());
        return Ok(());
    }
    let at = reserve_len(buf);
    if binary_params && value.prefers_binary() {
        value.write_binary(buf)?;
    } else {
        value.write_text(buf)?;
    }
    patch_len(buf, at);
    Ok(())
}

/// Write an Execute message; `max_rows` of 0 means no limit.
pub fn write_execute(buf: &mut Vec<u8>, portal: &str, max_rows: u32) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::EXECUTE);
    msg.write_cstr(portal);
    msg.write_i32(max_rows as i32);
    msg.finish();
}

fn write_describe(buf: &mut Vec<u8>, kind: u8, name: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::DESCRIBE);
    msg.write_u8(kind);
    msg.write_cstr(name);
    msg.finish();
}

/// Describe a prepared statement.
pub fn write_describe_statement(buf: &mut Vec<u8>, name: &str) {
    write_describe(buf, b'S', name);
}

/// Describe a portal.
pub fn write_describe_portal(buf: &mut Vec<u8>, name: &str) {
    write_describe(buf, b'P', name);
}

/// Close a prepared statement.
pub fn write_close_statement(buf: &mut Vec<u8>, name: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::CLOSE);
    msg.write_u8(b'S');
    msg.write_cstr(name);
    msg.finish();
}

/// Write a Sync message.
pub fn write_sync(buf: &mut Vec<u8>) {
    let msg = MessageBuilder::new(buf, super::msg_type::SYNC);
    msg.finish();
}

/// Write a Flush message.
pub fn write_flush(buf: &mut Vec<u8>) {
    let msg = MessageBuilder::new(buf, super::msg_type::FLUSH);
    msg.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::Value;

    #[test]
    fn test_parse() {
        let mut buf = Vec::new();
        write_parse(&mut buf, "zg_1", "select $1", &[]);
        assert_eq!(buf[0], b'P');
        assert_eq!(&buf[1..5], &((buf.len() - 1) as i32).to_be_bytes());
        assert_eq!(&buf[5..], b"zg_1\0select $1\0\0\0");
    }

    #[test]
    fn test_bind_text_params() {
        let mut buf = Vec::new();
        write_bind(&mut buf, "", "zg_1", &(7_i32, None::<i32>), false, &[0, 0]).unwrap();

        let mut expected = vec![b'B', 0, 0, 0, 0];
        expected.extend_from_slice(b"\0zg_1\0");
        expected.extend_from_slice(&[0, 0]); // no param formats
        expected.extend_from_slice(&[0, 2]); // two values
        expected.extend_from_slice(&[0, 0, 0, 1, b'7']);
        expected.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        expected.extend_from_slice(&[0, 0]); // results all text
        let len = (expected.len() - 1) as i32;
        expected[1..5].copy_from_slice(&len.to_be_bytes());
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_bind_binary_bytea() {
        let params = vec![Value::Bytea(vec![0xde, 0xad]), Value::Text("x".into())];
        let mut buf = Vec::new();
        write_bind(&mut buf, "", "", &params, true, &[0, 1, 0, 1]).unwrap();

        let body = &buf[5..];
        assert_eq!(&body[..2], b"\0\0");
        // two format codes: binary then text
        assert_eq!(&body[2..8], &[0, 2, 0, 1, 0, 0]);
        assert_eq!(&body[8..10], &[0, 2]);
        assert_eq!(&body[10..16], &[0, 0, 0, 2, 0xde, 0xad]);
        assert_eq!(&body[16..21], &[0, 0, 0, 1, b'x']);
        assert_eq!(&body[21..], &[0, 1, 0, 1]);
    }

    #[test]
    fn test_describe_and_close() {
        let mut buf = Vec::new();
        write_describe_statement(&mut buf, "zg_2");
        assert_eq!(&buf[5..], b"Szg_2\0");

        buf.clear();
        write_close_statement(&mut buf, "zg_2");
        assert_eq!(buf[0], b'C');
        assert_eq!(&buf[5..], b"Szg_2\0");
    }

    #[test]
    fn test_execute_and_sync() {
        let mut buf = Vec::new();
        write_execute(&mut buf, "", 0);
        assert_eq!(buf, [b'E', 0, 0, 0, 9, 0, 0, 0, 0, 0]);

        buf.clear();
        write_sync(&mut buf);
        assert_eq!(buf, [b'S', 0, 0, 0, 4]);
    }
}
