//! COPY ... FROM STDIN.
//!
//! Rows are written from the caller's task while a spawned reader owns the
//! read half of the transport, so an error the server raises mid-stream is
//! seen without waiting for CopyDone.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::buffer_set::BufferSet;
use crate::conversion::{ToWireValue, Value};
use crate::error::{Error, Result};
use crate::protocol::backend::{
    CommandComplete, CopyInResponse, ErrorResponse, RawMessage, ReadyForQuery, msg_type,
};
use crate::protocol::frontend::copy::{begin_copy_data, finish_copy_data};
use crate::protocol::frontend::{write_copy_done, write_copy_fail, write_query};
use crate::protocol::types::TransactionStatus;
use crate::quote::quote_identifier;
use crate::state::action::AsyncMessage;

use super::conn::{Conn, Exchange};
use super::stream::{Stream, read_message};

/// First error observed by either side of the session.
type Sticky = Arc<Mutex<Option<Arc<Error>>>>;

fn record(sticky: &Sticky, error: Error) {
    let mut slot = match sticky.lock() {
        Ok(slot) => slot,
        Err(poisoned) => poisoned.into_inner(),
    };
    if slot.is_none() {
        *slot = Some(Arc::new(error));
    }
}

fn observed(sticky: &Sticky) -> Option<Arc<Error>> {
    match sticky.lock() {
        Ok(slot) => slot.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// What the reader hands back at ReadyForQuery.
struct ReaderOutcome {
    read_half: ReadHalf<Stream>,
    rows_affected: Option<u64>,
    /// `None` when the reader stopped before ReadyForQuery.
    ready: Option<TransactionStatus>,
    messages: Vec<AsyncMessage>,
}

/// Consume server messages until ReadyForQuery.
async fn read_responses(
    mut read_half: ReadHalf<Stream>,
    sticky: Sticky,
    done: oneshot::Sender<ReaderOutcome>,
) {
    let mut buffer_set = BufferSet::new();
    let mut rows_affected = None;
    let mut messages = Vec::new();

    let ready = loop {
        if let Err(e) = read_message(&mut read_half, &mut buffer_set).await {
            record(&sticky, e);
            break None;
        }
        let payload = buffer_set.read_buffer.as_slice();
        match buffer_set.type_byte {
            msg_type::COMMAND_COMPLETE => {
                match CommandComplete::parse(payload).and_then(|c| c.rows_affected()) {
                    Ok(n) => rows_affected = n,
                    Err(e) => record(&sticky, e),
                }
            }
            msg_type::ERROR_RESPONSE => match ErrorResponse::parse(payload) {
                Ok(response) => record(&sticky, response.into_error()),
                Err(e) => record(&sticky, e),
            },
            msg_type::READY_FOR_QUERY => {
                match ReadyForQuery::parse(payload).and_then(|r| r.transaction_status()) {
                    Ok(status) => break Some(status),
                    Err(e) => {
                        record(&sticky, e);
                        break None;
                    }
                }
            }
            t if RawMessage::is_async_type(t) => match AsyncMessage::parse(t, payload) {
                Ok(msg) => {
                    debug!("async message during COPY: {:?}", msg);
                    messages.push(msg);
                }
                Err(e) => record(&sticky, e),
            },
            other => record(
                &sticky,
                Error::Protocol(format!(
                    "unexpected message '{}' during COPY",
                    char::from(other)
                )),
            ),
        }
    };

    let _ = done.send(ReaderOutcome {
        read_half,
        rows_affected,
        ready,
        messages,
    });
}

/// Append one row in COPY text format.
fn encode_row(buf: &mut Vec<u8>, row: &[Value]) -> Result<()> {
    let mut text = Vec::new();
    for (i, value) in row.iter().enumerate() {
        if i > 0 {
            buf.push(b'\t');
        }
        if value.is_null() {
            buf.extend_from_slice(b"\\N");
            continue;
        }
        text.clear();
        value.write_text(&mut text)?;
        for &b in &text {
            match b {
                b'\\' => buf.extend_from_slice(b"\\\\"),
                b'\t' => buf.extend_from_slice(b"\\t"),
                b'\n' => buf.extend_from_slice(b"\\n"),
                b'\r' => buf.extend_from_slice(b"\\r"),
                _ => buf.push(b),
            }
        }
    }
    buf.push(b'\n');
    Ok(())
}

/// `COPY "table" ("a", "b") FROM STDIN`
pub fn copy_in_statement(table: &str, columns: &[&str]) -> String {
    let mut sql = format!("COPY {}", quote_identifier(table));
    if !columns.is_empty() {
        let quoted: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
        sql.push_str(&format!(" ({})", quoted.join(", ")));
    }
    sql.push_str(" FROM STDIN");
    sql
}

impl Conn {
    /// Start `COPY ... FROM STDIN` inside the open transaction.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidUsage` outside a transaction, and the server
    /// error when the statement is rejected.
    pub async fn copy_in(&mut self, sql: &str) -> Result<CopyIn<'_>> {
        let result = self.copy_in_inner(sql).await;
        self.mark_broken(result)?;
        CopyIn::start(self)
    }

    async fn copy_in_inner(&mut self, sql: &str) -> Result<()> {
        self.settle().await?;
        if !self.in_transaction() {
            return Err(Error::InvalidUsage(
                "COPY must run inside a transaction".into(),
            ));
        }
        self.begin_exchange().await?;
        self.buffer_set.write_buffer.clear();
        write_query(&mut self.buffer_set.write_buffer, sql);
        self.write_buffer().await?;

        let mut error = None;
        loop {
            self.read_message().await?;
            let payload = self.buffer_set.read_buffer.as_slice();
            match self.buffer_set.type_byte {
                msg_type::COPY_IN_RESPONSE if error.is_none() => {
                    let response = CopyInResponse::parse(payload)?;
                    trace!("COPY started, binary={}", response.is_binary());
                    return Ok(());
                }
                msg_type::ERROR_RESPONSE => {
                    if error.is_none() {
                        error = Some(ErrorResponse::parse(payload)?.into_error());
                    }
                }
                msg_type::READY_FOR_QUERY => {
                    self.transaction_status =
                        ReadyForQuery::parse(payload)?.transaction_status()?;
                    self.exchange = Exchange::Idle;
                    return Err(error.unwrap_or_else(|| {
                        Error::Protocol("unexpected ReadyForQuery before CopyInResponse".into())
                    }));
                }
                t if RawMessage::is_async_type(t) => {
                    let msg = AsyncMessage::parse(t, payload)?;
                    self.handle_async(&msg);
                }
                _ => {
                    if error.is_none() {
                        error = Some(Error::InvalidUsage(
                            "statement did not start COPY FROM STDIN".into(),
                        ));
                    }
                }
            }
        }
    }
}

/// A running COPY FROM STDIN session.
///
/// Finish it with [`CopyIn::close`], [`CopyIn::fail`] or an empty
/// [`CopyIn::send_row`]. Dropping it unfinished breaks the connection.
pub struct CopyIn<'a> {
    conn: &'a mut Conn,
    writer: Option<WriteHalf<Stream>>,
    reader: Option<oneshot::Receiver<ReaderOutcome>>,
    sticky: Sticky,
    buf: Vec<u8>,
    /// Length position of the open CopyData frame in `buf`.
    frame: Option<usize>,
    buffer_size: usize,
    closed: bool,
}

impl<'a> CopyIn<'a> {
    fn start(conn: &'a mut Conn) -> Result<Self> {
        let stream = conn.stream.take().ok_or(Error::ConnectionBroken)?;
        let (read_half, write_half) = tokio::io::split(stream);
        let sticky = Sticky::default();
        let (done, reader) = oneshot::channel();
        tokio::spawn(read_responses(read_half, Arc::clone(&sticky), done));
        let buffer_size = conn.opts.copy_buffer_size;
        Ok(Self {
            conn,
            writer: Some(write_half),
            reader: Some(reader),
            sticky,
            buf: Vec::with_capacity(buffer_size + 1024),
            frame: None,
            buffer_size,
            closed: false,
        })
    }

    /// Queue one row.
    ///
    /// Returns `Ok(None)` for a data row. An empty row finishes the session
    /// like [`Self::close`] and returns the rows affected.
    pub async fn send_row(&mut self, row: &[Value]) -> Result<Option<u64>> {
        if row.is_empty() {
            return self.close().await;
        }
        if self.closed {
            return Err(Error::InvalidUsage("copy session closed".into()));
        }
        if let Some(e) = observed(&self.sticky) {
            return Err(Error::Copy(e));
        }

        let mark = self.buf.len();
        let opened = self.frame.is_none();
        if opened {
            self.frame = Some(begin_copy_data(&mut self.buf));
        }
        if let Err(e) = encode_row(&mut self.buf, row) {
            self.buf.truncate(mark);
            if opened {
                self.frame = None;
            }
            return Err(e);
        }

        if self.buf.len() > self.buffer_size {
            self.flush_frame().await?;
        }
        Ok(None)
    }

    /// Send buffered rows now.
    pub async fn flush(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::InvalidUsage("copy session closed".into()));
        }
        self.flush_frame().await
    }

    async fn flush_frame(&mut self) -> Result<()> {
        if let Some(at) = self.frame.take() {
            finish_copy_data(&mut self.buf, at);
        }
        if self.buf.is_empty() {
            return Ok(());
        }
        trace!("flushing {} bytes of COPY data", self.buf.len());
        self.write_buf().await
    }

    async fn write_buf(&mut self) -> Result<()> {
        let Self {
            writer, buf, conn, sticky, ..
        } = self;
        let writer = writer.as_mut().ok_or(Error::ConnectionBroken)?;
        let written = async {
            writer.write_all(buf).await?;
            writer.flush().await
        }
        .await;
        buf.clear();
        if let Err(e) = written {
            record(sticky, Error::Io(e));
            conn.poisoned = true;
            return Err(observed(sticky).map_or(Error::ConnectionBroken, Error::Copy));
        }
        Ok(())
    }

    /// Flush, send CopyDone and return the rows affected.
    ///
    /// An error the server raised during the session is returned here, once.
    pub async fn close(&mut self) -> Result<Option<u64>> {
        if self.closed {
            return Err(Error::InvalidUsage("copy session closed".into()));
        }
        self.closed = true;
        let result = async {
            self.flush_frame().await?;
            write_copy_done(&mut self.buf);
            self.write_buf().await?;
            self.finish().await
        }
        .await;
        self.conn.mark_broken(result)
    }

    /// Abort the session with CopyFail.
    ///
    /// The server answers with an error (SQLSTATE 57014), which is returned.
    pub async fn fail(&mut self, reason: &str) -> Result<()> {
        if self.closed {
            return Err(Error::InvalidUsage("copy session closed".into()));
        }
        self.closed = true;
        let result = async {
            self.buf.clear();
            self.frame = None;
            write_copy_fail(&mut self.buf, reason);
            self.write_buf().await?;
            self.finish().await.map(|_| ())
        }
        .await;
        self.conn.mark_broken(result)
    }

    /// Wait for the reader and give the transport back to the connection.
    async fn finish(&mut self) -> Result<Option<u64>> {
        let reader = self.reader.take().ok_or(Error::ConnectionBroken)?;
        let outcome = match reader.await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("COPY reader stopped without reporting; closing the connection");
                self.conn.poisoned = true;
                return Err(Error::ConnectionBroken);
            }
        };
        let writer = self.writer.take().ok_or(Error::ConnectionBroken)?;
        self.conn.stream = Some(outcome.read_half.unsplit(writer));
        for msg in &outcome.messages {
            self.conn.handle_async(msg);
        }
        match outcome.ready {
            Some(status) => {
                self.conn.transaction_status = status;
                self.conn.exchange = Exchange::Idle;
            }
            None => self.conn.poisoned = true,
        }

        match observed(&self.sticky) {
            Some(e) => Err(Error::Copy(e)),
            None => Ok(outcome.rows_affected),
        }
    }
}

impl Drop for CopyIn<'_> {
    fn drop(&mut self) {
        if !self.closed {
            warn!("COPY session dropped without close; the connection is now broken");
            self.conn.poisoned = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::tokio::conn::tests::{message, mock_conn};

    fn row_text(row: &[Value]) -> String {
        let mut buf = Vec::new();
        encode_row(&mut buf, row).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_encode_row() {
        assert_eq!(
            row_text(&[Value::Int4(1), Value::Null, Value::Text("a\tb\\c\nd\re".into())]),
            "1\t\\N\ta\\tb\\\\c\\nd\\re\n"
        );
        assert_eq!(row_text(&[Value::Bytea(vec![0xde, 0xad])]), "\\\\xdead\n");
        assert_eq!(
            row_text(&[Value::Bool(true), Value::Bool(false)]),
            "true\tfalse\n"
        );
    }

    #[test]
    fn test_copy_in_statement() {
        assert_eq!(copy_in_statement("items", &[]), "COPY \"items\" FROM STDIN");
        assert_eq!(
            copy_in_statement("my table", &["id", "na\"me"]),
            "COPY \"my table\" (\"id\", \"na\"\"me\") FROM STDIN"
        );
    }

    #[tokio::test]
    async fn test_copy_requires_transaction() {
        let (mut conn, _server) = mock_conn();
        let err = conn.copy_in("COPY t FROM STDIN").await.err().unwrap();
        assert!(matches!(err, Error::InvalidUsage(ref m) if m == "COPY must run inside a transaction"));
        assert!(!conn.is_broken());
    }

    #[tokio::test]
    async fn test_copy_round_trip() {
        let (mut conn, mut server) = mock_conn();
        conn.transaction_status = TransactionStatus::InTransaction;
        server
            .write_all(&message(b'G', &[0, 0, 1, 0, 0]))
            .await
            .unwrap();

        let mut copy = conn.copy_in("COPY t FROM STDIN").await.unwrap();
        copy.send_row(&[Value::Int4(1), Value::Text("one".into())]).await.unwrap();
        copy.send_row(&[Value::Int4(2), Value::Null]).await.unwrap();

        let mut expected = message(b'Q', b"COPY t FROM STDIN\0");
        expected.extend(message(b'd', b"1\tone\n2\t\\N\n"));
        expected.extend(message(b'c', b""));

        let server_task = tokio::spawn(async move {
            let mut received = vec![0_u8; expected.len()];
            server.read_exact(&mut received).await.unwrap();
            assert_eq!(received, expected);
            server.write_all(&message(b'C', b"COPY 2\0")).await.unwrap();
            server.write_all(&message(b'Z', b"T")).await.unwrap();
            server
        });

        assert_eq!(copy.close().await.unwrap(), Some(2));
        assert!(matches!(copy.close().await, Err(Error::InvalidUsage(_))));
        assert!(matches!(
            copy.send_row(&[Value::Int4(3)]).await,
            Err(Error::InvalidUsage(ref m)) if m == "copy session closed"
        ));
        drop(copy);
        let _server = server_task.await.unwrap();

        assert!(!conn.is_broken());
        assert!(conn.in_transaction());
    }

    #[tokio::test]
    async fn test_copy_error_is_sticky() {
        let (mut conn, mut server) = mock_conn();
        conn.transaction_status = TransactionStatus::InTransaction;
        server
            .write_all(&message(b'G', &[0, 0, 1, 0, 0]))
            .await
            .unwrap();
        let mut copy = conn.copy_in("COPY t FROM STDIN").await.unwrap();

        server
            .write_all(&message(b'E', b"SERROR\0C23505\0Mduplicate key\0\0"))
            .await
            .unwrap();
        server.write_all(&message(b'Z', b"E")).await.unwrap();

        // The reader records the error concurrently; wait until it shows.
        let err = loop {
            match copy.send_row(&[Value::Int4(1)]).await {
                Ok(_) => tokio::task::yield_now().await,
                Err(e) => break e,
            }
        };
        assert_eq!(err.sqlstate(), Some("23505"));

        let err = copy.close().await.unwrap_err();
        assert_eq!(err.sqlstate(), Some("23505"));
        drop(copy);
        assert!(!conn.is_broken());
        assert!(conn.in_transaction());
        drop(server);
    }

    #[tokio::test]
    async fn test_dropped_session_breaks_connection() {
        let (mut conn, mut server) = mock_conn();
        conn.transaction_status = TransactionStatus::InTransaction;
        server
            .write_all(&message(b'G', &[0, 0, 1, 0, 0]))
            .await
            .unwrap();
        let copy = conn.copy_in("COPY t FROM STDIN").await.unwrap();
        drop(copy);
        assert!(conn.is_broken());
        assert!(matches!(conn.ping().await, Err(Error::ConnectionBroken)));
    }
}
