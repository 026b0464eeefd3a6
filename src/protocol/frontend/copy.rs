//! COPY protocol frontend messages.

use crate::protocol::codec::{MessageBuilder, patch_message_len, reserve_len};

/// Open a CopyData frame whose body the caller appends directly.
///
/// Returns the length position to hand to [`finish_copy_data`].
pub fn begin_copy_data(buf: &mut Vec<u8>) -> usize {
    buf.push(super::msg_type::COPY_DATA);
    reserve_len(buf)
}

/// Close a frame opened by [`begin_copy_data`].
pub fn finish_copy_data(buf: &mut [u8], at: usize) {
    patch_message_len(buf, at);
}

/// Write a CopyDone message.
pub fn write_copy_done(buf: &mut Vec<u8>) {
    let msg = MessageBuilder::new(buf, super::msg_type::COPY_DONE);
    msg.finish();
}

/// Write a CopyFail message.
pub fn write_copy_fail(buf: &mut Vec<u8>, reason: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::COPY_FAIL);
    msg.write_cstr(reason);
    msg.finish();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_data_frame() {
        let mut buf = Vec::new();
        let at = begin_copy_data(&mut buf);
        buf.extend_from_slice(b"1\tone\n");
        finish_copy_data(&mut buf, at);
        assert_eq!(buf, [b'd', 0, 0, 0, 10, b'1', b'\t', b'o', b'n', b'e', b'\n']);
    }

    #[test]
    fn test_incremental_copy_data() {
        let mut buf = vec![b'c', 0, 0, 0, 4];
        let at = begin_copy_data(&mut buf);
        buf.extend_from_slice(b"1\t\\N\n");
        buf.extend_from_slice(b"2\tx\n");
        finish_copy_data(&mut buf, at);

        let payload = b"1\t\\N\n2\tx\n";
        assert_eq!(&buf[..5], &[b'c', 0, 0, 0, 4]);
        assert_eq!(buf[5], b'd');
        assert_eq!(&buf[6..10], &(payload.len() as i32 + 4).to_be_bytes());
        assert_eq!(&buf[10..], payload);
    }

    #[test]
    fn test_copy_done_and_fail() {
        let mut buf = Vec::new();
        write_copy_done(&mut buf);
        assert_eq!(buf, [b'c', 0, 0, 0, 4]);

        buf.clear();
        write_copy_fail(&mut buf, "abort");
        assert_eq!(buf[0], b'f');
        assert_eq!(&buf[5..], b"abort\0");
    }
}
