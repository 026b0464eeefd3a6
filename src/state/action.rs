//! Action types for state machine I/O requests.

use crate::error::{ErrorFields, Result};
use crate::protocol::backend::{NoticeResponse, NotificationResponse, ParameterStatus, msg_type};

/// Action requested by a state machine.
///
/// The caller performs the requested I/O and calls `step()` again. The
/// last three variants hand control back to the caller without I/O.
#[derive(Debug)]
pub enum Action {
    /// Write `buffer_set.write_buffer`, then read a single byte into `buffer_set.type_byte`.
    ///
    /// Used for SSL negotiation ('S' or 'N').
    WriteAndReadByte,

    /// Read one message into `buffer_set`.
    ReadMessage,

    /// Write `buffer_set.write_buffer` and flush.
    Write,

    /// Write `buffer_set.write_buffer`, flush, then read one message.
    WriteAndReadMessage,

    /// Upgrade the transport to TLS, then call `step()` again.
    TlsHandshake,

    /// Deliver an asynchronous message, then read the next message.
    HandleAsyncMessageAndReadMessage(AsyncMessage),

    /// A result set begins; its RowDescription is in the machine.
    ResultStart,

    /// `buffer_set.read_buffer` holds a DataRow payload.
    Row,

    /// A statement finished (CommandComplete or EmptyQueryResponse).
    ResultEnd,

    /// The exchange reached ReadyForQuery.
    Finished,
}

/// Asynchronous message from the server.
///
/// These can arrive at any time, including in the middle of a result set.
#[derive(Debug, Clone)]
pub enum AsyncMessage {
    /// Notification from LISTEN/NOTIFY.
    Notification {
        /// PID of the notifying backend process
        pid: u32,
        channel: String,
        payload: String,
    },

    /// Non-fatal notice or warning.
    Notice(ErrorFields),

    /// A server parameter changed (e.g. after `SET DateStyle`).
    ParameterChanged { name: String, value: String },
}

impl AsyncMessage {
    /// Parse an async message; `type_byte` must satisfy [`crate::protocol::RawMessage::is_async_type`].
    pub(crate) fn parse(type_byte: u8, payload: &[u8]) -> Result<Self> {
        match type_byte {
            msg_type::NOTICE_RESPONSE => Ok(AsyncMessage::Notice(NoticeResponse::parse(payload)?.0)),
            msg_type::PARAMETER_STATUS => {
                let param = ParameterStatus::parse(payload)?;
                Ok(AsyncMessage::ParameterChanged {
                    name: param.name.to_string(),
                    value: param.value.to_string(),
                })
            }
            _ => {
                let notification = NotificationResponse::parse(payload)?;
                Ok(AsyncMessage::Notification {
                    pid: notification.pid,
                    channel: notification.channel.to_string(),
                    payload: notification.payload.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_async_messages() {
        let msg = AsyncMessage::parse(b'S', b"DateStyle\0ISO, MDY\0").unwrap();
        assert!(matches!(
            msg,
            AsyncMessage::ParameterChanged { ref name, ref value } if name == "DateStyle" && value == "ISO, MDY"
        ));

        let mut payload = 42_u32.to_be_bytes().to_vec();
        payload.extend_from_slice(b"jobs\0run\0");
        let msg = AsyncMessage::parse(b'A', &payload).unwrap();
        assert!(matches!(
            msg,
            AsyncMessage::Notification { pid: 42, ref channel, ref payload } if channel == "jobs" && payload == "run"
        ));

        let msg = AsyncMessage::parse(b'N', b"SWARNING\0Mcareful\0\0").unwrap();
        assert!(matches!(msg, AsyncMessage::Notice(f) if f.message.as_deref() == Some("careful")));
    }
}
