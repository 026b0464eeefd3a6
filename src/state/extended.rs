//! Extended query protocol state machines: prepare, execute, close.

use std::sync::Arc;

use crate::buffer_set::BufferSet;
use crate::conversion::ToParams;
use crate::error::{Error, Result};
use crate::protocol::backend::{
    CommandComplete, ErrorResponse, ParameterDescription, RawMessage, ReadyForQuery,
    RowDescription, msg_type, tag,
};
use crate::protocol::frontend::{
    write_bind, write_close_statement, write_describe_portal, write_describe_statement,
    write_execute, write_parse, write_sync,
};
use crate::protocol::types::{Oid, TransactionStatus};
use crate::row::{Column, columns_from};

use super::StateMachine;
use super::action::{Action, AsyncMessage};

/// Result formats of a query sent without a prior Describe: all text.
const ALL_TEXT: &[u8] = &[0, 0];

/// Shared handling of ReadyForQuery, errors and async messages.
///
/// Returns `None` when the message is for the machine's own state logic.
fn common_step(
    buffer_set: &BufferSet,
    error: &mut Option<Error>,
    draining: &mut bool,
    finished: &mut bool,
    transaction_status: &mut TransactionStatus,
) -> Result<Option<Action>> {
    let type_byte = buffer_set.type_byte;
    let payload = &buffer_set.read_buffer;

    if RawMessage::is_async_type(type_byte) {
        let msg = AsyncMessage::parse(type_byte, payload)?;
        return Ok(Some(Action::HandleAsyncMessageAndReadMessage(msg)));
    }
    if *draining {
        if type_byte == msg_type::READY_FOR_QUERY {
            *transaction_status = ReadyForQuery::parse(payload)?.transaction_status()?;
            *finished = true;
            return match error.take() {
                Some(err) => Err(err),
                None => Err(Error::Protocol("drained without an error".into())),
            };
        }
        return Ok(Some(Action::ReadMessage));
    }
    if type_byte == msg_type::ERROR_RESPONSE {
        *error = Some(ErrorResponse::parse(payload)?.into_error());
        *draining = true;
        return Ok(Some(Action::ReadMessage));
    }
    Ok(None)
}

fn unexpected(type_byte: u8, during: &str) -> Error {
    Error::Protocol(format!("unexpected message '{}' {}", tag(type_byte), during))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrepareState {
    Initial,
    WaitingParse,
    WaitingParams,
    WaitingRowDescription,
    WaitingReady,
}

/// Parse + Describe(S) + Sync, expecting `1`, `t`, `T`|`n`, `Z`.
#[derive(Debug)]
pub struct PrepareStateMachine {
    state: PrepareState,
    param_oids: Vec<Oid>,
    columns: Arc<[Column]>,
    error: Option<Error>,
    draining: bool,
    finished: bool,
    transaction_status: TransactionStatus,
}

impl PrepareStateMachine {
    pub fn new(buffer_set: &mut BufferSet, name: &str, query: &str) -> Self {
        buffer_set.write_buffer.clear();
        write_parse(&mut buffer_set.write_buffer, name, query, &[]);
        write_describe_statement(&mut buffer_set.write_buffer, name);
        write_sync(&mut buffer_set.write_buffer);
        Self {
            state: PrepareState::Initial,
            param_oids: Vec::new(),
            columns: Arc::from(Vec::new()),
            error: None,
            draining: false,
            finished: false,
            transaction_status: TransactionStatus::Idle,
        }
    }

    /// Parameter types and result columns of the described statement.
    pub fn into_parts(self) -> (Vec<Oid>, Arc<[Column]>) {
        (self.param_oids, self.columns)
    }
}

impl StateMachine for PrepareStateMachine {
    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        if self.state == PrepareState::Initial {
            self.state = PrepareState::WaitingParse;
            return Ok(Action::WriteAndReadMessage);
        }
        if let Some(action) = common_step(
            buffer_set,
            &mut self.error,
            &mut self.draining,
            &mut self.finished,
            &mut self.transaction_status,
        )? {
            return Ok(action);
        }

        let payload = &buffer_set.read_buffer;
        match (self.state, buffer_set.type_byte) {
            (PrepareState::WaitingParse, msg_type::PARSE_COMPLETE) => {
                self.state = PrepareState::WaitingParams;
            }
            (PrepareState::WaitingParams, msg_type::PARAMETER_DESCRIPTION) => {
                self.param_oids = ParameterDescription::parse(payload)?.into_oids();
                self.state = PrepareState::WaitingRowDescription;
            }
            (PrepareState::WaitingRowDescription, msg_type::ROW_DESCRIPTION) => {
                self.columns = columns_from(&RowDescription::parse(payload)?);
                self.state = PrepareState::WaitingReady;
            }
            (PrepareState::WaitingRowDescription, msg_type::NO_DATA) => {
                self.state = PrepareState::WaitingReady;
            }
            (PrepareState::WaitingReady, msg_type::READY_FOR_QUERY) => {
                self.transaction_status = ReadyForQuery::parse(payload)?.transaction_status()?;
                self.finished = true;
                return Ok(Action::Finished);
            }
            (_, other) => return Err(unexpected(other, "while preparing a statement")),
        }
        Ok(Action::ReadMessage)
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecState {
    Initial,
    WaitingParse,
    WaitingBind,
    WaitingPortalDescription,
    Lookahead,
    InResultSet,
    WaitingReady,
}

/// Bind + Execute + Sync over the unnamed portal.
///
/// After BindComplete the machine looks at one more message before
/// reporting [`Action::ResultStart`], so a failing Execute surfaces as an
/// error from the call instead of from the cursor. That message must be
/// put back with [`ExtendedQueryStateMachine::take_lookahead`].
#[derive(Debug)]
pub struct ExtendedQueryStateMachine {
    state: ExecState,
    expects_parse: bool,
    need_read: bool,
    lookahead: bool,
    columns: Arc<[Column]>,
    command_tag: Option<String>,
    error: Option<Error>,
    draining: bool,
    finished: bool,
    transaction_status: TransactionStatus,
}

impl ExtendedQueryStateMachine {
    fn with_state(columns: Arc<[Column]>, expects_parse: bool) -> Self {
        Self {
            state: ExecState::Initial,
            expects_parse,
            need_read: false,
            lookahead: false,
            columns,
            command_tag: None,
            error: None,
            draining: false,
            finished: false,
            transaction_status: TransactionStatus::Idle,
        }
    }

    /// Execute a statement that was already described.
    pub fn execute<P: ToParams + ?Sized>(
        buffer_set: &mut BufferSet,
        statement: &str,
        columns: Arc<[Column]>,
        result_formats: &[u8],
        params: &P,
        binary_params: bool,
    ) -> Result<Self> {
        buffer_set.write_buffer.clear();
        write_bind(
            &mut buffer_set.write_buffer,
            "",
            statement,
            params,
            binary_params,
            result_formats,
        )?;
        write_execute(&mut buffer_set.write_buffer, "", 0);
        write_sync(&mut buffer_set.write_buffer);
        Ok(Self::with_state(columns, false))
    }

    /// Parse + Bind + Describe(P) + Execute + Sync in one round trip.
    ///
    /// Used when binary parameters are enabled; results come back as text.
    pub fn one_shot<P: ToParams + ?Sized>(
        buffer_set: &mut BufferSet,
        query: &str,
        params: &P,
    ) -> Result<Self> {
        buffer_set.write_buffer.clear();
        write_parse(&mut buffer_set.write_buffer, "", query, &[]);
        write_bind(&mut buffer_set.write_buffer, "", "", params, true, ALL_TEXT)?;
        write_describe_portal(&mut buffer_set.write_buffer, "");
        write_execute(&mut buffer_set.write_buffer, "", 0);
        write_sync(&mut buffer_set.write_buffer);
        Ok(Self::with_state(Arc::from(Vec::new()), true))
    }

    pub fn columns(&self) -> &Arc<[Column]> {
        &self.columns
    }

    /// Tag of the completed statement; `None` after an empty query.
    pub fn command_tag(&self) -> Option<&str> {
        self.command_tag.as_deref()
    }

    /// True once, right after [`Action::ResultStart`]: the message in the
    /// read buffer belongs to the result and must be saved for the next read.
    pub fn take_lookahead(&mut self) -> bool {
        std::mem::take(&mut self.lookahead)
    }

    fn read_next(&mut self, action: Action) -> Result<Action> {
        self.need_read = true;
        Ok(action)
    }
}

impl StateMachine for ExtendedQueryStateMachine {
    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        if std::mem::take(&mut self.need_read) {
            return Ok(Action::ReadMessage);
        }
        if self.state == ExecState::Initial {
            self.state = if self.expects_parse {
                ExecState::WaitingParse
            } else {
                ExecState::WaitingBind
            };
            return Ok(Action::WriteAndReadMessage);
        }
        if self.finished {
            return Err(Error::Protocol("query already reached ReadyForQuery".into()));
        }
        if let Some(action) = common_step(
            buffer_set,
            &mut self.error,
            &mut self.draining,
            &mut self.finished,
            &mut self.transaction_status,
        )? {
            return Ok(action);
        }

        let type_byte = buffer_set.type_byte;
        let payload = &buffer_set.read_buffer;
        match (self.state, type_byte) {
            (ExecState::WaitingParse, msg_type::PARSE_COMPLETE) => {
                self.state = ExecState::WaitingBind;
                Ok(Action::ReadMessage)
            }
            (ExecState::WaitingBind, msg_type::BIND_COMPLETE) => {
                self.state = if self.expects_parse {
                    ExecState::WaitingPortalDescription
                } else {
                    ExecState::Lookahead
                };
                Ok(Action::ReadMessage)
            }
            (ExecState::WaitingPortalDescription, msg_type::ROW_DESCRIPTION) => {
                self.columns = columns_from(&RowDescription::parse(payload)?);
                self.state = ExecState::Lookahead;
                Ok(Action::ReadMessage)
            }
            (ExecState::WaitingPortalDescription, msg_type::NO_DATA) => {
                self.state = ExecState::Lookahead;
                Ok(Action::ReadMessage)
            }
            (
                ExecState::Lookahead,
                msg_type::COMMAND_COMPLETE | msg_type::DATA_ROW | msg_type::EMPTY_QUERY_RESPONSE,
            ) => {
                self.state = ExecState::InResultSet;
                self.lookahead = true;
                self.read_next(Action::ResultStart)
            }
            (ExecState::Lookahead, other) => Err(unexpected(other, "after BindComplete")),
            (ExecState::InResultSet, msg_type::DATA_ROW) => self.read_next(Action::Row),
            (ExecState::InResultSet, msg_type::COMMAND_COMPLETE) => {
                self.command_tag = Some(CommandComplete::parse(payload)?.tag.to_string());
                self.state = ExecState::WaitingReady;
                self.read_next(Action::ResultEnd)
            }
            (ExecState::InResultSet, msg_type::EMPTY_QUERY_RESPONSE) => {
                self.command_tag = None;
                self.state = ExecState::WaitingReady;
                self.read_next(Action::ResultEnd)
            }
            (ExecState::WaitingReady, msg_type::READY_FOR_QUERY) => {
                self.transaction_status = ReadyForQuery::parse(payload)?.transaction_status()?;
                self.finished = true;
                Ok(Action::Finished)
            }
            (state, other) => Err(unexpected(other, &format!("in extended query ({:?})", state))),
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Close(S) + Sync, expecting `3` then `Z`.
#[derive(Debug)]
pub struct CloseStatementStateMachine {
    started: bool,
    closed: bool,
    error: Option<Error>,
    draining: bool,
    finished: bool,
    transaction_status: TransactionStatus,
}

impl CloseStatementStateMachine {
    pub fn new(buffer_set: &mut BufferSet, name: &str) -> Self {
        buffer_set.write_buffer.clear();
        write_close_statement(&mut buffer_set.write_buffer, name);
        write_sync(&mut buffer_set.write_buffer);
        Self {
            started: false,
            closed: false,
            error: None,
            draining: false,
            finished: false,
            transaction_status: TransactionStatus::Idle,
        }
    }
}

impl StateMachine for CloseStatementStateMachine {
    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        if !self.started {
            self.started = true;
            return Ok(Action::WriteAndReadMessage);
        }
        if let Some(action) = common_step(
            buffer_set,
            &mut self.error,
            &mut self.draining,
            &mut self.finished,
            &mut self.transaction_status,
        )? {
            return Ok(action);
        }
        match (self.closed, buffer_set.type_byte) {
            (false, msg_type::CLOSE_COMPLETE) => {
                self.closed = true;
                Ok(Action::ReadMessage)
            }
            (true, msg_type::READY_FOR_QUERY) => {
                self.transaction_status =
                    ReadyForQuery::parse(&buffer_set.read_buffer)?.transaction_status()?;
                self.finished = true;
                Ok(Action::Finished)
            }
            (_, other) => Err(unexpected(other, "while closing a statement")),
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::oid;
    use crate::state::tests::{data_row_payload, feed, row_description_payload};

    const SERVER_ERROR: &[u8] = b"SERROR\0C22P02\0Minvalid input syntax\0\0";

    #[test]
    fn test_prepare() {
        let mut bs = BufferSet::new();
        let mut sm = PrepareStateMachine::new(&mut bs, "zg_1", "select $1::int4");
        assert_eq!(bs.write_buffer[0], b'P');
        assert!(matches!(sm.step(&mut bs).unwrap(), Action::WriteAndReadMessage));

        assert!(matches!(feed(&mut sm, &mut bs, b'1', b""), Action::ReadMessage));
        let mut params = 1_u16.to_be_bytes().to_vec();
        params.extend_from_slice(&oid::INT4.to_be_bytes());
        assert!(matches!(feed(&mut sm, &mut bs, b't', &params), Action::ReadMessage));
        let desc = row_description_payload(&[("int4", oid::INT4)]);
        assert!(matches!(feed(&mut sm, &mut bs, b'T', &desc), Action::ReadMessage));
        assert!(matches!(feed(&mut sm, &mut bs, b'Z', b"I"), Action::Finished));

        let (param_oids, columns) = sm.into_parts();
        assert_eq!(param_oids, vec![oid::INT4]);
        assert_eq!(columns[0].type_oid(), oid::INT4);
    }

    #[test]
    fn test_prepare_error_drains() {
        let mut bs = BufferSet::new();
        let mut sm = PrepareStateMachine::new(&mut bs, "", "selec");
        sm.step(&mut bs).unwrap();
        assert!(matches!(feed(&mut sm, &mut bs, b'E', SERVER_ERROR), Action::ReadMessage));
        bs.load(b'Z', b"I");
        assert_eq!(sm.step(&mut bs).unwrap_err().sqlstate(), Some("22P02"));
        assert!(sm.is_finished());
    }

    #[test]
    fn test_prepare_out_of_order() {
        let mut bs = BufferSet::new();
        let mut sm = PrepareStateMachine::new(&mut bs, "", "select 1");
        sm.step(&mut bs).unwrap();
        bs.load(b't', &0_u16.to_be_bytes());
        assert!(matches!(sm.step(&mut bs), Err(Error::Protocol(_))));
    }

    fn executed() -> (ExtendedQueryStateMachine, BufferSet) {
        let mut bs = BufferSet::new();
        let mut sm = ExtendedQueryStateMachine::execute(
            &mut bs,
            "zg_1",
            Arc::from(Vec::new()),
            ALL_TEXT,
            &(1_i32,),
            false,
        )
        .unwrap();
        assert_eq!(bs.write_buffer[0], b'B');
        assert!(matches!(sm.step(&mut bs).unwrap(), Action::WriteAndReadMessage));
        assert!(matches!(feed(&mut sm, &mut bs, b'2', b""), Action::ReadMessage));
        (sm, bs)
    }

    #[test]
    fn test_lookahead_row() {
        let (mut sm, mut bs) = executed();
        let row = data_row_payload(&[Some(&b"1"[..])]);
        assert!(matches!(feed(&mut sm, &mut bs, b'D', &row), Action::ResultStart));
        assert!(sm.take_lookahead());
        assert!(!sm.take_lookahead());
        assert!(matches!(sm.step(&mut bs).unwrap(), Action::ReadMessage));

        // the saved DataRow is read back
        assert!(matches!(feed(&mut sm, &mut bs, b'D', &row), Action::Row));
        sm.step(&mut bs).unwrap();
        assert!(matches!(feed(&mut sm, &mut bs, b'C', b"SELECT 1\0"), Action::ResultEnd));
        sm.step(&mut bs).unwrap();
        assert!(matches!(feed(&mut sm, &mut bs, b'Z', b"I"), Action::Finished));
        assert_eq!(sm.command_tag(), Some("SELECT 1"));
    }

    #[test]
    fn test_lookahead_error() {
        let (mut sm, mut bs) = executed();
        assert!(matches!(feed(&mut sm, &mut bs, b'E', SERVER_ERROR), Action::ReadMessage));
        assert!(!sm.take_lookahead());
        bs.load(b'Z', b"I");
        assert_eq!(sm.step(&mut bs).unwrap_err().sqlstate(), Some("22P02"));
    }

    #[test]
    fn test_lookahead_unexpected() {
        let (mut sm, mut bs) = executed();
        bs.load(b'Z', b"I");
        assert!(matches!(sm.step(&mut bs), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_one_shot() {
        let mut bs = BufferSet::new();
        let params = vec![crate::conversion::Value::Bytea(vec![1])];
        let mut sm = ExtendedQueryStateMachine::one_shot(&mut bs, "select $1", &params).unwrap();
        assert_eq!(bs.write_buffer[0], b'P');
        sm.step(&mut bs).unwrap();
        assert!(matches!(feed(&mut sm, &mut bs, b'1', b""), Action::ReadMessage));
        assert!(matches!(feed(&mut sm, &mut bs, b'2', b""), Action::ReadMessage));
        let desc = row_description_payload(&[("bytea", oid::BYTEA)]);
        assert!(matches!(feed(&mut sm, &mut bs, b'T', &desc), Action::ReadMessage));
        assert_eq!(sm.columns().len(), 1);
        assert!(matches!(feed(&mut sm, &mut bs, b'C', b"SELECT 1\0"), Action::ResultStart));
        assert!(sm.take_lookahead());
    }

    #[test]
    fn test_close_statement() {
        let mut bs = BufferSet::new();
        let mut sm = CloseStatementStateMachine::new(&mut bs, "zg_3");
        assert_eq!(bs.write_buffer[0], b'C');
        sm.step(&mut bs).unwrap();
        assert!(matches!(feed(&mut sm, &mut bs, b'3', b""), Action::ReadMessage));
        assert!(matches!(feed(&mut sm, &mut bs, b'Z', b"T"), Action::Finished));
        assert_eq!(sm.transaction_status(), TransactionStatus::InTransaction);
    }
}
