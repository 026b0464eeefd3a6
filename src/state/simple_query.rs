//! Simple query protocol state machine.

use std::sync::Arc;

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::protocol::backend::{
    CommandComplete, ErrorResponse, RawMessage, ReadyForQuery, RowDescription, msg_type, tag,
};
use crate::protocol::frontend::write_query;
use crate::protocol::types::TransactionStatus;
use crate::row::{Column, columns_from};

use super::StateMachine;
use super::action::{Action, AsyncMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    /// Between statements: expecting T, C, I, E or Z.
    WaitingResponse,
    /// After T: expecting D or C.
    InResultSet,
    /// An error was seen; skipping to ReadyForQuery.
    Draining,
    Finished,
}

/// Simple query protocol state machine.
///
/// One Query message may hold several statements, so the machine reports
/// every result set with [`Action::ResultStart`] / [`Action::Row`] /
/// [`Action::ResultEnd`] and stops at [`Action::Finished`]. The first
/// ErrorResponse is kept and returned once ReadyForQuery arrives.
#[derive(Debug)]
pub struct SimpleQueryStateMachine {
    state: State,
    need_read: bool,
    columns: Arc<[Column]>,
    command_tag: Option<String>,
    error: Option<Error>,
    transaction_status: TransactionStatus,
}

impl SimpleQueryStateMachine {
    /// Queue the Query message; the first `step()` sends it.
    pub fn new(buffer_set: &mut BufferSet, query: &str) -> Self {
        buffer_set.write_buffer.clear();
        write_query(&mut buffer_set.write_buffer, query);
        Self {
            state: State::Initial,
            need_read: false,
            columns: Arc::from(Vec::new()),
            command_tag: None,
            error: None,
            transaction_status: TransactionStatus::Idle,
        }
    }

    /// Columns of the current result set.
    pub fn columns(&self) -> &Arc<[Column]> {
        &self.columns
    }

    /// Tag of the last completed statement; `None` after an empty query.
    pub fn command_tag(&self) -> Option<&str> {
        self.command_tag.as_deref()
    }

    fn read_next(&mut self, action: Action) -> Result<Action> {
        self.need_read = true;
        Ok(action)
    }
}

impl StateMachine for SimpleQueryStateMachine {
    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        if std::mem::take(&mut self.need_read) {
            return Ok(Action::ReadMessage);
        }
        match self.state {
            State::Initial => {
                self.state = State::WaitingResponse;
                return Ok(Action::WriteAndReadMessage);
            }
            State::Finished => {
                return Err(Error::Protocol("query already reached ReadyForQuery".into()));
            }
            _ => {}
        }

        let type_byte = buffer_set.type_byte;
        let payload = &buffer_set.read_buffer;

        if RawMessage::is_async_type(type_byte) {
            let msg = AsyncMessage::parse(type_byte, payload)?;
            return Ok(Action::HandleAsyncMessageAndReadMessage(msg));
        }

        match (self.state, type_byte) {
            (_, msg_type::READY_FOR_QUERY) => {
                self.transaction_status = ReadyForQuery::parse(payload)?.transaction_status()?;
                self.state = State::Finished;
                match self.error.take() {
                    Some(err) => Err(err),
                    None => Ok(Action::Finished),
                }
            }
            (State::Draining, _) => Ok(Action::ReadMessage),
            (_, msg_type::ERROR_RESPONSE) => {
                self.error = Some(ErrorResponse::parse(payload)?.into_error());
                self.state = State::Draining;
                Ok(Action::ReadMessage)
            }
            (State::WaitingResponse, msg_type::ROW_DESCRIPTION) => {
                buffer_set.column_buffer.clear();
                buffer_set.column_buffer.extend_from_slice(payload);
                self.columns = columns_from(&RowDescription::parse(&buffer_set.column_buffer)?);
                self.command_tag = None;
                self.state = State::InResultSet;
                self.read_next(Action::ResultStart)
            }
            (State::InResultSet, msg_type::DATA_ROW) => self.read_next(Action::Row),
            (State::WaitingResponse, msg_type::DATA_ROW) => Err(Error::Protocol(
                "DataRow without a preceding RowDescription".into(),
            )),
            (State::WaitingResponse | State::InResultSet, msg_type::COMMAND_COMPLETE) => {
                let complete = CommandComplete::parse(payload)?;
                self.command_tag = Some(complete.tag.to_string());
                self.state = State::WaitingResponse;
                self.read_next(Action::ResultEnd)
            }
            (State::WaitingResponse, msg_type::EMPTY_QUERY_RESPONSE) => {
                self.command_tag = None;
                self.read_next(Action::ResultEnd)
            }
            (state, other) => Err(Error::Protocol(format!(
                "unexpected message '{}' in simple query ({:?})",
                tag(other),
                state
            ))),
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    fn is_finished(&self) -> bool {
        self.state == State::Finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::{data_row_payload, feed, row_description_payload};

    fn machine() -> (SimpleQueryStateMachine, BufferSet) {
        let mut bs = BufferSet::new();
        let sm = SimpleQueryStateMachine::new(&mut bs, "select 1");
        (sm, bs)
    }

    #[test]
    fn test_writes_query_first() {
        let (mut sm, mut bs) = machine();
        assert_eq!(bs.write_buffer[0], b'Q');
        assert!(matches!(sm.step(&mut bs).unwrap(), Action::WriteAndReadMessage));
    }

    #[test]
    fn test_rows_then_ready() {
        let (mut sm, mut bs) = machine();
        sm.step(&mut bs).unwrap();

        let desc = row_description_payload(&[("one", 23)]);
        assert!(matches!(feed(&mut sm, &mut bs, b'T', &desc), Action::ResultStart));
        assert_eq!(sm.columns()[0].name(), "one");
        assert!(matches!(sm.step(&mut bs).unwrap(), Action::ReadMessage));

        let row = data_row_payload(&[Some(&b"1"[..])]);
        assert!(matches!(feed(&mut sm, &mut bs, b'D', &row), Action::Row));
        assert!(matches!(sm.step(&mut bs).unwrap(), Action::ReadMessage));

        assert!(matches!(feed(&mut sm, &mut bs, b'C', b"SELECT 1\0"), Action::ResultEnd));
        assert_eq!(sm.command_tag(), Some("SELECT 1"));
        sm.step(&mut bs).unwrap();

        assert!(matches!(feed(&mut sm, &mut bs, b'Z', b"T"), Action::Finished));
        assert_eq!(sm.transaction_status(), TransactionStatus::InTransaction);
        assert!(sm.is_finished());
    }

    #[test]
    fn test_error_is_returned_at_ready() {
        let (mut sm, mut bs) = machine();
        sm.step(&mut bs).unwrap();

        let action = feed(&mut sm, &mut bs, b'E', b"SERROR\0C42P01\0Mno such table\0\0");
        assert!(matches!(action, Action::ReadMessage));
        // later statements of the batch are skipped
        assert!(matches!(feed(&mut sm, &mut bs, b'C', b"INSERT 0 1\0"), Action::ReadMessage));

        bs.load(b'Z', b"I");
        let err = sm.step(&mut bs).unwrap_err();
        assert_eq!(err.sqlstate(), Some("42P01"));
        assert!(sm.is_finished());
    }

    #[test]
    fn test_empty_query() {
        let (mut sm, mut bs) = machine();
        sm.step(&mut bs).unwrap();
        assert!(matches!(feed(&mut sm, &mut bs, b'I', b""), Action::ResultEnd));
        assert_eq!(sm.command_tag(), None);
    }

    #[test]
    fn test_data_row_without_description() {
        let (mut sm, mut bs) = machine();
        sm.step(&mut bs).unwrap();
        bs.load(b'D', &data_row_payload(&[None]));
        assert!(matches!(sm.step(&mut bs), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_notice_mid_result() {
        let (mut sm, mut bs) = machine();
        sm.step(&mut bs).unwrap();
        let action = feed(&mut sm, &mut bs, b'N', b"SNOTICE\0Mhello\0\0");
        assert!(matches!(
            action,
            Action::HandleAsyncMessageAndReadMessage(AsyncMessage::Notice(_))
        ));
    }
}
