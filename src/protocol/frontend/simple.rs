//! Simple query protocol messages.

use crate::protocol::codec::MessageBuilder;

/// Write a Query message. The string may hold several `;`-separated statements.
pub fn write_query(buf: &mut Vec<u8>, query: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::QUERY);
    msg.write_cstr(query);
    msg.finish();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query() {
        let mut buf = Vec::new();
        write_query(&mut buf, "select 1; select 2");
        assert_eq!(buf[0], b'Q');
        assert_eq!(&buf[1..5], &23_i32.to_be_bytes());
        assert_eq!(&buf[5..], b"select 1; select 2\0");
    }
}
