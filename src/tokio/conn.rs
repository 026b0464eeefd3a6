//! Asynchronous connection.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::buffer_set::BufferSet;
use crate::conversion::{FromRow, ToParams};
use crate::error::{Error, Result};
use crate::handler::AsyncMessageHandler;
use crate::opts::Opts;
use crate::protocol::backend::{BackendKeyData, RawMessage, ReadyForQuery, msg_type};
use crate::protocol::frontend::write_terminate;
use crate::protocol::types::TransactionStatus;
use crate::state::action::{Action, AsyncMessage};
use crate::state::connection::ConnectionStateMachine;
use crate::state::extended::{
    CloseStatementStateMachine, ExtendedQueryStateMachine, PrepareStateMachine,
};
use crate::state::simple_query::SimpleQueryStateMachine;
use crate::state::StateMachine;
use crate::statement::{IntoStatement, PreparedStatement};

use super::connect::Endpoint;
use super::rows::{Cursor, QueryMachine, Rows};
use super::stream::Stream;

/// Maximum number of bind parameters the protocol can carry.
const MAX_PARAMS: usize = 65535;

/// A message read ahead of the state machine that will consume it.
#[derive(Debug)]
struct SavedMessage {
    type_byte: u8,
    payload: Vec<u8>,
}

/// Where the connection is within a request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exchange {
    /// At ReadyForQuery.
    Idle,
    /// A result cursor is alive or was dropped before the end.
    Streaming,
    /// I/O is in progress; seeing this at an entry point means the
    /// previous operation was dropped mid-I/O.
    InFlight,
}

/// Outcome of [`Conn::exec`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecResult {
    /// Tag of the last statement; `None` for an empty query
    pub tag: Option<String>,
    pub rows_affected: Option<u64>,
}

/// Asynchronous connection.
pub struct Conn {
    /// `None` while a COPY session owns the transport, or after a COPY
    /// session was abandoned.
    pub(super) stream: Option<Stream>,
    pub(super) buffer_set: BufferSet,
    pub(super) opts: Opts,
    pub(super) endpoint: Endpoint,
    backend_key: Option<BackendKeyData>,
    server_params: Vec<(String, String)>,
    pub(super) transaction_status: TransactionStatus,
    pub(super) poisoned: bool,
    stmt_counter: u64,
    saved: Option<SavedMessage>,
    pub(super) exchange: Exchange,
    async_message_handler: Option<Box<dyn AsyncMessageHandler>>,
}

impl Conn {
    /// Connect to a server.
    ///
    /// Accepts an [`Opts`], a connection string, or a [`url::Url`]. Every
    /// host of a multi-host string is tried in order.
    pub async fn new<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts = opts.try_into()?;
        super::connect::connect(opts).await
    }

    fn from_parts(stream: Stream, opts: Opts, endpoint: Endpoint) -> Self {
        Self {
            stream: Some(stream),
            buffer_set: BufferSet::with_read_capacity(opts.min_read_buffer_size),
            opts,
            endpoint,
            backend_key: None,
            server_params: Vec::new(),
            transaction_status: TransactionStatus::Idle,
            poisoned: false,
            stmt_counter: 0,
            saved: None,
            exchange: Exchange::Idle,
            async_message_handler: None,
        }
    }

    /// Run startup and authentication over an open transport.
    pub(crate) async fn handshake(mut stream: Stream, opts: Opts, endpoint: Endpoint) -> Result<Self> {
        let mut buffer_set = BufferSet::with_read_capacity(opts.min_read_buffer_size);
        let mut state_machine =
            ConnectionStateMachine::new(&opts, &endpoint.host, endpoint.tls.is_some());

        loop {
            match state_machine.step(&mut buffer_set)? {
                Action::WriteAndReadByte => {
                    stream.write_all(&buffer_set.write_buffer).await?;
                    stream.flush().await?;
                    buffer_set.type_byte = stream.read_u8().await?;
                }
                Action::ReadMessage | Action::HandleAsyncMessageAndReadMessage(_) => {
                    stream.read_message(&mut buffer_set).await?;
                }
                Action::Write => {
                    stream.write_all(&buffer_set.write_buffer).await?;
                    stream.flush().await?;
                }
                Action::WriteAndReadMessage => {
                    stream.write_all(&buffer_set.write_buffer).await?;
                    stream.flush().await?;
                    stream.read_message(&mut buffer_set).await?;
                }
                Action::TlsHandshake => {
                    let tls = endpoint.tls.as_ref().ok_or_else(|| {
                        Error::Protocol("TLS handshake requested without TLS settings".into())
                    })?;
                    stream = stream.upgrade_to_tls(tls).await?;
                }
                Action::Finished => break,
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected {other:?} during startup"
                    )));
                }
            }
        }

        let mut conn = Self::from_parts(stream, opts, endpoint);
        conn.buffer_set = buffer_set;
        conn.backend_key = state_machine.backend_key().copied();
        conn.server_params = state_machine.take_server_params();
        conn.transaction_status = state_machine.transaction_status();
        Ok(conn)
    }

    /// Get the backend key data for query cancellation.
    pub fn backend_key(&self) -> Option<&BackendKeyData> {
        self.backend_key.as_ref()
    }

    /// Get the connection ID (backend process ID).
    ///
    /// Returns 0 if the backend key data is not available.
    pub fn connection_id(&self) -> u32 {
        self.backend_key.as_ref().map_or(0, |k| k.process_id())
    }

    /// Parameters reported by the server, kept current by ParameterStatus.
    pub fn server_params(&self) -> &[(String, String)] {
        &self.server_params
    }

    pub fn parameter_status(&self, name: &str) -> Option<&str> {
        self.server_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Server version in `server_version_num` form, e.g. `90204` for 9.2.4
    /// or `150002` for 15.2.
    pub fn server_version(&self) -> Option<u32> {
        parse_server_version(self.parameter_status("server_version")?)
    }

    /// Status reported by the last ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_status.in_transaction()
    }

    /// Check if the connection is broken.
    pub fn is_broken(&self) -> bool {
        self.poisoned
    }

    /// Set the async message handler.
    ///
    /// The handler is called when the server sends asynchronous messages:
    /// - `Notification` - from LISTEN/NOTIFY
    /// - `Notice` - warnings and informational messages
    /// - `ParameterChanged` - server parameter updates
    pub fn set_async_message_handler<H: AsyncMessageHandler + 'static>(&mut self, handler: H) {
        self.async_message_handler = Some(Box::new(handler));
    }

    /// Remove the async message handler.
    pub fn clear_async_message_handler(&mut self) {
        self.async_message_handler = None;
    }

    /// Ping the server with an empty query to check connection aliveness.
    pub async fn ping(&mut self) -> Result<()> {
        self.query_drop("", ()).await?;
        Ok(())
    }

    /// Send Terminate and shut the transport down.
    pub async fn close(mut self) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        if !self.poisoned {
            self.buffer_set.write_buffer.clear();
            write_terminate(&mut self.buffer_set.write_buffer);
            stream.write_all(&self.buffer_set.write_buffer).await?;
            stream.flush().await?;
        }
        stream.shutdown().await?;
        Ok(())
    }

    // === Exchange bookkeeping ===

    pub(super) fn mark_broken<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result
            && e.is_connection_broken()
        {
            self.poisoned = true;
        }
        result
    }

    pub(super) async fn poison(&mut self) {
        self.poisoned = true;
        if let Some(stream) = self.stream.as_mut() {
            let _ = stream.shutdown().await;
        }
    }

    /// Make the connection ready for a new request and mark it in flight.
    pub(super) async fn begin_exchange(&mut self) -> Result<()> {
        if self.poisoned {
            return Err(Error::ConnectionBroken);
        }
        match self.exchange {
            Exchange::Idle => {}
            Exchange::Streaming => self.drain_to_ready().await?,
            Exchange::InFlight => {
                warn!("previous operation was interrupted mid-exchange, closing the connection");
                self.poison().await;
                return Err(Error::ConnectionBroken);
            }
        }
        self.exchange = Exchange::InFlight;
        Ok(())
    }

    /// Finish an abandoned result stream so the status is current.
    pub(super) async fn settle(&mut self) -> Result<()> {
        if self.exchange == Exchange::Streaming && !self.poisoned {
            let result = self.drain_to_ready().await;
            self.mark_broken(result)?;
        }
        Ok(())
    }

    /// Skip what is left of an abandoned exchange up to ReadyForQuery.
    async fn drain_to_ready(&mut self) -> Result<()> {
        self.exchange = Exchange::InFlight;
        loop {
            self.read_message().await?;
            match self.buffer_set.type_byte {
                msg_type::READY_FOR_QUERY => {
                    self.transaction_status =
                        ReadyForQuery::parse(&self.buffer_set.read_buffer)?.transaction_status()?;
                    break;
                }
                t if RawMessage::is_async_type(t) => {
                    let msg = AsyncMessage::parse(t, &self.buffer_set.read_buffer)?;
                    self.handle_async(&msg);
                }
                _ => {}
            }
        }
        self.exchange = Exchange::Idle;
        Ok(())
    }

    pub(super) async fn read_message(&mut self) -> Result<()> {
        if let Some(saved) = self.saved.take() {
            self.buffer_set.type_byte = saved.type_byte;
            self.buffer_set.read_buffer = saved.payload;
            return Ok(());
        }
        let Self {
            stream, buffer_set, ..
        } = self;
        let stream = stream.as_mut().ok_or(Error::ConnectionBroken)?;
        stream.read_message(buffer_set).await
    }

    /// Keep the message in the read buffer for the next [`Self::read_message`].
    fn save_message(&mut self) -> Result<()> {
        if self.saved.is_some() {
            return Err(Error::Protocol("unexpected save of message".into()));
        }
        self.saved = Some(SavedMessage {
            type_byte: self.buffer_set.type_byte,
            payload: self.buffer_set.read_buffer.clone(),
        });
        Ok(())
    }

    pub(super) async fn write_buffer(&mut self) -> Result<()> {
        let Self {
            stream, buffer_set, ..
        } = self;
        let stream = stream.as_mut().ok_or(Error::ConnectionBroken)?;
        stream.write_all(&buffer_set.write_buffer).await?;
        stream.flush().await?;
        Ok(())
    }

    pub(super) fn handle_async(&mut self, msg: &AsyncMessage) {
        if let AsyncMessage::ParameterChanged { name, value } = msg {
            match self.server_params.iter_mut().find(|(n, _)| n == name) {
                Some(entry) => entry.1.clone_from(value),
                None => self.server_params.push((name.clone(), value.clone())),
            }
        }
        match self.async_message_handler.as_mut() {
            Some(handler) => handler.handle(msg),
            None => {
                if let AsyncMessage::Notice(fields) = msg {
                    debug!("server notice: {}", fields);
                }
            }
        }
    }

    /// Step a machine until it hands control back to the caller.
    ///
    /// Returns on ResultStart, Row, ResultEnd and Finished.
    async fn drive<S: StateMachine>(&mut self, state_machine: &mut S) -> Result<Action> {
        loop {
            let action = match state_machine.step(&mut self.buffer_set) {
                Ok(action) => action,
                Err(e) => {
                    if state_machine.is_finished() {
                        self.transaction_status = state_machine.transaction_status();
                        self.exchange = Exchange::Idle;
                    }
                    return Err(e);
                }
            };
            match action {
                Action::ReadMessage => self.read_message().await?,
                Action::Write => self.write_buffer().await?,
                Action::WriteAndReadMessage => {
                    self.write_buffer().await?;
                    self.read_message().await?;
                }
                Action::HandleAsyncMessageAndReadMessage(msg) => {
                    self.handle_async(&msg);
                    self.read_message().await?;
                }
                Action::WriteAndReadByte | Action::TlsHandshake => {
                    return Err(Error::Protocol(format!(
                        "unexpected {action:?} in query state machine"
                    )));
                }
                Action::Finished => {
                    self.transaction_status = state_machine.transaction_status();
                    self.exchange = Exchange::Idle;
                    return Ok(Action::Finished);
                }
                Action::ResultStart | Action::Row | Action::ResultEnd => return Ok(action),
            }
        }
    }

    /// Drive a machine that produces no results to ReadyForQuery.
    async fn drive_to_end<S: StateMachine>(&mut self, state_machine: &mut S) -> Result<()> {
        match self.drive(state_machine).await? {
            Action::Finished => Ok(()),
            other => Err(Error::Protocol(format!("unexpected {other:?}"))),
        }
    }

    /// Drive a query machine one yield further, saving the lookahead message.
    pub(super) async fn advance(&mut self, machine: &mut QueryMachine) -> Result<Action> {
        self.exchange = Exchange::InFlight;
        let action = self.drive(machine).await?;
        match action {
            Action::Finished => {}
            Action::ResultStart => {
                if machine.take_lookahead() {
                    self.save_message()?;
                }
                self.exchange = Exchange::Streaming;
            }
            _ => self.exchange = Exchange::Streaming,
        }
        Ok(action)
    }

    // === Queries ===

    /// Run a statement and return a cursor over its results.
    ///
    /// SQL text without parameters goes through the simple query protocol
    /// and may hold several statements; anything else uses the extended
    /// protocol.
    pub async fn query<S: IntoStatement, P: ToParams>(
        &mut self,
        statement: S,
        params: P,
    ) -> Result<Rows<'_>> {
        let result = self.start_query(&statement, &params).await;
        let cursor = self.mark_broken(result)?;
        Ok(Rows::new(self, cursor))
    }

    /// Run SQL text through the simple query protocol.
    pub async fn query_simple(&mut self, sql: &str) -> Result<Rows<'_>> {
        let result = self.start_simple(sql).await;
        let cursor = self.mark_broken(result)?;
        Ok(Rows::new(self, cursor))
    }

    /// Collect the rows of the first result set.
    pub async fn query_collect<T: for<'a> FromRow<'a>, S: IntoStatement, P: ToParams>(
        &mut self,
        statement: S,
        params: P,
    ) -> Result<Vec<T>> {
        let mut rows = self.query(statement, params).await?;
        let collected = rows.collect().await?;
        rows.close().await?;
        Ok(collected)
    }

    /// First row of the first result set, if any.
    pub async fn query_first<T: for<'a> FromRow<'a>, S: IntoStatement, P: ToParams>(
        &mut self,
        statement: S,
        params: P,
    ) -> Result<Option<T>> {
        let mut rows = self.query(statement, params).await?;
        let first = match rows.next().await? {
            Some(row) => Some(row.decode::<T>()?),
            None => None,
        };
        rows.close().await?;
        Ok(first)
    }

    /// Run a statement, discard its rows and return the rows affected.
    pub async fn query_drop<S: IntoStatement, P: ToParams>(
        &mut self,
        statement: S,
        params: P,
    ) -> Result<Option<u64>> {
        Ok(self.exec(statement, params).await?.rows_affected)
    }

    /// Run a statement to completion and report its command tag.
    ///
    /// With several statements in one simple query, the last tag wins.
    pub async fn exec<S: IntoStatement, P: ToParams>(
        &mut self,
        statement: S,
        params: P,
    ) -> Result<ExecResult> {
        let mut rows = self.query(statement, params).await?;
        rows.close().await?;
        if rows.result_sets_seen() == 0 {
            rows.conn_mut().poisoned = true;
            return Err(Error::Protocol("unexpected ReadyForQuery".into()));
        }
        Ok(ExecResult {
            tag: rows.command_tag().map(str::to_string),
            rows_affected: rows.rows_affected()?,
        })
    }

    /// Run a prepared statement and return a cursor over its rows.
    pub async fn query_prepared<P: ToParams>(
        &mut self,
        statement: &PreparedStatement,
        params: P,
    ) -> Result<Rows<'_>> {
        self.query(statement, params).await
    }

    pub async fn exec_prepared<P: ToParams>(
        &mut self,
        statement: &PreparedStatement,
        params: P,
    ) -> Result<ExecResult> {
        self.exec(statement, params).await
    }

    async fn start_simple(&mut self, sql: &str) -> Result<Cursor> {
        self.begin_exchange().await?;
        let machine = SimpleQueryStateMachine::new(&mut self.buffer_set, sql);
        Cursor::start(self, QueryMachine::Simple(machine)).await
    }

    async fn start_query<S: IntoStatement, P: ToParams>(
        &mut self,
        statement: &S,
        params: &P,
    ) -> Result<Cursor> {
        let count = params.param_count();
        if count > MAX_PARAMS {
            return Err(Error::InvalidUsage(format!(
                "got {count} parameters but PostgreSQL only supports {MAX_PARAMS} parameters"
            )));
        }

        let machine = if let Some(stmt) = statement.as_prepared() {
            self.bind(stmt, params).await?
        } else {
            let sql = statement.as_sql().unwrap_or_default();
            if count == 0 {
                return self.start_simple(sql).await;
            }
            if self.opts.binary_parameters {
                self.begin_exchange().await?;
                let machine = ExtendedQueryStateMachine::one_shot(&mut self.buffer_set, sql, params);
                QueryMachine::Extended(self.written(machine)?)
            } else {
                let stmt = self.prepare_named(String::new(), sql).await?;
                self.bind(&stmt, params).await?
            }
        };
        Cursor::start(self, machine).await
    }

    /// Queue Bind + Execute + Sync for a described statement.
    async fn bind<P: ToParams>(&mut self, stmt: &PreparedStatement, params: &P) -> Result<QueryMachine> {
        let count = params.param_count();
        if count != stmt.param_oids().len() {
            return Err(Error::InvalidUsage(format!(
                "got {} parameters but the statement requires {}",
                count,
                stmt.param_oids().len()
            )));
        }
        self.begin_exchange().await?;
        let machine = ExtendedQueryStateMachine::execute(
            &mut self.buffer_set,
            stmt.name(),
            Arc::clone(stmt.columns()),
            stmt.result_formats(),
            params,
            self.opts.binary_parameters,
        );
        Ok(QueryMachine::Extended(self.written(machine)?))
    }

    /// An encode failure leaves nothing on the wire, so the exchange is idle again.
    fn written<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.exchange = Exchange::Idle;
        }
        result
    }

    // === Prepared statements ===

    /// Parse and describe `sql` as a named statement.
    pub async fn prepare(&mut self, sql: &str) -> Result<PreparedStatement> {
        self.stmt_counter += 1;
        let name = format!("zg_{}", self.stmt_counter);
        let result = self.prepare_named(name, sql).await;
        self.mark_broken(result)
    }

    async fn prepare_named(&mut self, name: String, sql: &str) -> Result<PreparedStatement> {
        self.begin_exchange().await?;
        let mut state_machine = PrepareStateMachine::new(&mut self.buffer_set, &name, sql);
        self.drive_to_end(&mut state_machine).await?;
        let (param_oids, columns) = state_machine.into_parts();
        Ok(PreparedStatement::new(
            name,
            param_oids,
            columns,
            self.opts.disable_prepared_binary_result,
        ))
    }

    /// Release a prepared statement on the server.
    pub async fn close_statement(&mut self, stmt: &PreparedStatement) -> Result<()> {
        let result = self.close_statement_inner(stmt.name()).await;
        self.mark_broken(result)
    }

    async fn close_statement_inner(&mut self, name: &str) -> Result<()> {
        self.begin_exchange().await?;
        let mut state_machine = CloseStatementStateMachine::new(&mut self.buffer_set, name);
        self.drive_to_end(&mut state_machine).await
    }

    // === Transactions ===

    /// Start a transaction block.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidUsage` if a transaction is already open.
    pub async fn begin(&mut self) -> Result<()> {
        self.settle().await?;
        if self.in_transaction() {
            return Err(Error::InvalidUsage(
                "already in a transaction; nested transactions are not supported".into(),
            ));
        }
        self.query_drop("BEGIN", ()).await?;
        Ok(())
    }

    /// Commit the open transaction.
    ///
    /// A failed transaction cannot commit: it is rolled back and
    /// `Error::InvalidUsage` is returned.
    pub async fn commit(&mut self) -> Result<()> {
        self.settle().await?;
        if self.transaction_status == TransactionStatus::Failed {
            self.query_drop("ROLLBACK", ()).await?;
            return Err(Error::InvalidUsage("transaction aborted, rolled back".into()));
        }
        self.query_drop("COMMIT", ()).await?;
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.query_drop("ROLLBACK", ()).await?;
        Ok(())
    }

    /// Run `f` inside BEGIN ... COMMIT.
    ///
    /// If `f` fails the transaction is rolled back and its error returned.
    /// A transaction that `f` committed or rolled back itself is left alone.
    pub async fn run_transaction<R>(
        &mut self,
        f: impl AsyncFnOnce(&mut Conn) -> Result<R>,
    ) -> Result<R> {
        self.begin().await?;
        match f(&mut *self).await {
            Ok(value) => {
                self.settle().await?;
                if self.in_transaction() {
                    self.commit().await?;
                }
                Ok(value)
            }
            Err(e) => {
                if !self.poisoned {
                    let rollback = async {
                        self.settle().await?;
                        if self.in_transaction() {
                            self.rollback().await?;
                        }
                        Ok::<_, Error>(())
                    };
                    if let Err(rollback_error) = rollback.await {
                        warn!("rollback after failed transaction body failed: {}", rollback_error);
                    }
                }
                Err(e)
            }
        }
    }
}

/// `"9.2.4"` → 90204, `"15.2 (Debian)"` → 150002.
fn parse_server_version(version: &str) -> Option<u32> {
    let numeric = version.split(|c: char| !(c.is_ascii_digit() || c == '.')).next()?;
    let mut parts = numeric.split('.').map(|p| p.parse::<u32>().ok());
    let major = parts.next()??;
    let minor = parts.next().flatten().unwrap_or(0);
    if major >= 10 {
        Some(major * 10000 + minor)
    } else {
        let patch = parts.next().flatten().unwrap_or(0);
        Some(major * 10000 + minor * 100 + patch)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::SocketAddr;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::handler::CollectMessages;
    use crate::protocol::types::oid;
    use crate::state::tests::{data_row_payload, row_description_payload};
    use crate::tokio::connect::Target;

    pub(crate) fn message(type_byte: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![type_byte];
        out.extend_from_slice(&(payload.len() as i32 + 4).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    pub(crate) fn endpoint() -> Endpoint {
        let addr: SocketAddr = "127.0.0.1:5432".parse().unwrap();
        Endpoint {
            host: "127.0.0.1".into(),
            port: 5432,
            target: Target::Tcp(addr),
            tls: None,
        }
    }

    /// A connection past startup, talking to a scripted server.
    pub(crate) fn mock_conn() -> (Conn, DuplexStream) {
        let (client, server) = tokio::io::duplex(1 << 16);
        let opts = Opts {
            user: "tester".into(),
            ..Opts::default()
        };
        (Conn::from_parts(Stream::mock(client), opts, endpoint()), server)
    }

    async fn script(server: &mut DuplexStream, messages: &[Vec<u8>]) {
        for m in messages {
            server.write_all(m).await.unwrap();
        }
    }

    /// Everything the client has written so far.
    async fn sent(server: &mut DuplexStream) -> Vec<u8> {
        let mut buf = vec![0_u8; 1 << 16];
        let n = server.read(&mut buf).await.unwrap();
        buf.truncate(n);
        buf
    }

    fn param_description(oids: &[u32]) -> Vec<u8> {
        let mut payload = (oids.len() as u16).to_be_bytes().to_vec();
        for oid in oids {
            payload.extend_from_slice(&oid.to_be_bytes());
        }
        payload
    }

    fn ready(status: u8) -> Vec<u8> {
        message(b'Z', &[status])
    }

    fn int4_rows(values: &[&str]) -> Vec<Vec<u8>> {
        let mut out = vec![message(b'T', &row_description_payload(&[("n", oid::INT4)]))];
        for v in values {
            out.push(message(b'D', &data_row_payload(&[Some(v.as_bytes())])));
        }
        out.push(message(b'C', format!("SELECT {}\0", values.len()).as_bytes()));
        out
    }

    #[test]
    fn test_parse_server_version() {
        assert_eq!(parse_server_version("9.2.4"), Some(90204));
        assert_eq!(parse_server_version("9.6.24"), Some(90624));
        assert_eq!(parse_server_version("15.2 (Debian 15.2-1)"), Some(150002));
        assert_eq!(parse_server_version("16beta1"), Some(160000));
        assert_eq!(parse_server_version("abc"), None);
    }

    #[tokio::test]
    async fn test_handshake() {
        let (client, mut server) = tokio::io::duplex(1 << 16);
        let mut key = 7_u32.to_be_bytes().to_vec();
        key.extend_from_slice(&99_u32.to_be_bytes());
        script(
            &mut server,
            &[
                message(b'R', &0_i32.to_be_bytes()),
                message(b'K', &key),
                message(b'S', b"server_version\x009.2.4\0"),
                ready(b'I'),
            ],
        )
        .await;
        let opts = Opts {
            user: "tester".into(),
            ..Opts::default()
        };
        let conn = Conn::handshake(Stream::mock(client), opts, endpoint()).await.unwrap();
        assert_eq!(conn.connection_id(), 7);
        assert_eq!(conn.backend_key().map(|k| k.secret()), Some(99));
        assert_eq!(conn.server_version(), Some(90204));
        assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
    }

    #[tokio::test]
    async fn test_query_collect() {
        let (mut conn, mut server) = mock_conn();
        let mut response = int4_rows(&["1", "2"]);
        response.push(ready(b'I'));
        script(&mut server, &response).await;

        let rows: Vec<(i32,)> = conn.query_collect("select n", ()).await.unwrap();
        assert_eq!(rows, vec![(1,), (2,)]);
        assert_eq!(sent(&mut server).await, message(b'Q', b"select n\0"));
        assert_eq!(conn.exchange, Exchange::Idle);
    }

    #[tokio::test]
    async fn test_multiple_result_sets() {
        let (mut conn, mut server) = mock_conn();
        let mut response = int4_rows(&["5"]);
        response.push(message(b'C', b"INSERT 0 3\0"));
        response.push(ready(b'I'));
        script(&mut server, &response).await;

        let mut rows = conn.query_simple("select 5; insert ...").await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i32>(0).unwrap(), 5);
        assert!(rows.next().await.unwrap().is_none());
        assert_eq!(rows.rows_affected().unwrap(), Some(1));

        assert!(rows.has_next_result_set().await.unwrap());
        assert!(rows.next_result_set().await.unwrap());
        assert!(rows.columns().is_empty());
        assert!(rows.next().await.unwrap().is_none());
        assert_eq!(rows.command_tag(), Some("INSERT 0 3"));
        assert_eq!(rows.rows_affected().unwrap(), Some(3));

        assert!(!rows.next_result_set().await.unwrap());
        drop(rows);
        assert_eq!(conn.exchange, Exchange::Idle);
    }

    #[tokio::test]
    async fn test_dropped_rows_are_drained() {
        let (mut conn, mut server) = mock_conn();
        let mut response = int4_rows(&["1", "2", "3"]);
        response.push(ready(b'I'));
        response.push(message(b'C', b"SET\0"));
        response.push(ready(b'I'));
        script(&mut server, &response).await;

        {
            let mut rows = conn.query("select n", ()).await.unwrap();
            assert!(rows.next().await.unwrap().is_some());
        }
        assert_eq!(conn.exchange, Exchange::Streaming);

        let result = conn.exec("set x = 1", ()).await.unwrap();
        assert_eq!(result.tag.as_deref(), Some("SET"));
        assert_eq!(result.rows_affected, None);
        assert!(!conn.is_broken());
    }

    #[tokio::test]
    async fn test_server_error_keeps_connection() {
        let (mut conn, mut server) = mock_conn();
        script(
            &mut server,
            &[
                message(b'E', b"SERROR\0C42P01\0Mrelation does not exist\0\0"),
                ready(b'I'),
                message(b'I', b""),
                ready(b'I'),
            ],
        )
        .await;

        let err = conn.query_drop("select * from missing", ()).await.unwrap_err();
        assert_eq!(err.sqlstate(), Some("42P01"));
        assert!(!conn.is_broken());

        conn.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_without_result() {
        let (mut conn, mut server) = mock_conn();
        script(&mut server, &[ready(b'I')]).await;

        let err = conn.exec("select 1", ()).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(ref m) if m == "unexpected ReadyForQuery"));
        assert!(conn.is_broken());
    }

    #[tokio::test]
    async fn test_empty_query() {
        let (mut conn, mut server) = mock_conn();
        script(&mut server, &[message(b'I', b""), ready(b'I')]).await;

        let result = conn.exec("", ()).await.unwrap();
        assert_eq!(result, ExecResult::default());
    }

    #[tokio::test]
    async fn test_interrupted_exchange_poisons() {
        let (mut conn, _server) = mock_conn();
        conn.exchange = Exchange::InFlight;

        let err = conn.query_drop("select 1", ()).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionBroken));
        assert!(conn.is_broken());

        let err = conn.ping().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionBroken));
    }

    #[tokio::test]
    async fn test_prepared_statement() {
        let (mut conn, mut server) = mock_conn();
        script(
            &mut server,
            &[
                message(b'1', b""),
                message(b't', &param_description(&[oid::INT4])),
                message(b'T', &row_description_payload(&[("n", oid::INT4)])),
                ready(b'I'),
            ],
        )
        .await;

        let stmt = conn.prepare("select $1::int4 as n").await.unwrap();
        assert_eq!(stmt.name(), "zg_1");
        assert_eq!(stmt.param_oids(), &[oid::INT4]);
        let _ = sent(&mut server).await;

        let err = conn.exec_prepared(&stmt, ()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidUsage(ref m) if m == "got 0 parameters but the statement requires 1"));
        assert!(!conn.is_broken());

        script(
            &mut server,
            &[
                message(b'2', b""),
                message(b'D', &data_row_payload(&[Some(&42_i32.to_be_bytes()[..])])),
                message(b'C', b"SELECT 1\0"),
                ready(b'I'),
            ],
        )
        .await;
        let row: Option<(i32,)> = conn.query_first(&stmt, (42_i32,)).await.unwrap();
        assert_eq!(row, Some((42,)));
        assert_eq!(conn.exchange, Exchange::Idle);
    }

    #[tokio::test]
    async fn test_extended_error_after_bind() {
        let (mut conn, mut server) = mock_conn();
        script(
            &mut server,
            &[
                message(b'1', b""),
                message(b't', &param_description(&[oid::INT4])),
                message(b'n', b""),
                ready(b'I'),
                message(b'2', b""),
                message(b'E', b"SERROR\0C22012\0Mdivision by zero\0\0"),
                ready(b'I'),
            ],
        )
        .await;

        let err = conn.exec("select 1 / $1", (0_i32,)).await.unwrap_err();
        assert_eq!(err.sqlstate(), Some("22012"));
        assert!(!conn.is_broken());
        assert_eq!(conn.exchange, Exchange::Idle);
    }

    #[tokio::test]
    async fn test_too_many_params() {
        let (mut conn, _server) = mock_conn();
        let params = vec![0_i32; 65536];
        let err = conn.exec("select 1", params).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidUsage(ref m) if m == "got 65536 parameters but PostgreSQL only supports 65535 parameters"
        ));
        assert!(!conn.is_broken());
    }

    #[tokio::test]
    async fn test_commit_failed_transaction() {
        let (mut conn, mut server) = mock_conn();
        conn.transaction_status = TransactionStatus::Failed;
        script(&mut server, &[message(b'C', b"ROLLBACK\0"), ready(b'I')]).await;

        let err = conn.commit().await.unwrap_err();
        assert!(matches!(err, Error::InvalidUsage(ref m) if m == "transaction aborted, rolled back"));
        assert_eq!(sent(&mut server).await, message(b'Q', b"ROLLBACK\0"));
        assert!(!conn.in_transaction());
    }

    #[tokio::test]
    async fn test_begin_twice() {
        let (mut conn, _server) = mock_conn();
        conn.transaction_status = TransactionStatus::InTransaction;
        assert!(matches!(conn.begin().await, Err(Error::InvalidUsage(_))));
    }

    #[tokio::test]
    async fn test_async_messages() {
        let (mut conn, mut server) = mock_conn();
        let collector = CollectMessages::new();
        conn.set_async_message_handler(collector.share());

        let mut notify = 11_u32.to_be_bytes().to_vec();
        notify.extend_from_slice(b"jobs\0run\0");
        let mut response = vec![message(b'T', &row_description_payload(&[("n", oid::INT4)]))];
        response.push(message(b'A', &notify));
        response.push(message(b'D', &data_row_payload(&[Some(b"1")])));
        response.push(message(b'S', b"TimeZone\0UTC\0"));
        response.push(message(b'C', b"SELECT 1\0"));
        response.push(ready(b'I'));
        script(&mut server, &response).await;

        let rows: Vec<(i32,)> = conn.query_collect("select 1", ()).await.unwrap();
        assert_eq!(rows, vec![(1,)]);
        assert_eq!(conn.parameter_status("TimeZone"), Some("UTC"));
        let messages = collector.take();
        assert_eq!(messages.len(), 2);
        assert!(matches!(&messages[0], AsyncMessage::Notification { channel, .. } if channel == "jobs"));
    }
}
