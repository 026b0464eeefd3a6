//! Lazy, forward-only result cursor.

use std::sync::Arc;

use crate::buffer_set::BufferSet;
use crate::conversion::FromRow;
use crate::error::{Error, Result};
use crate::protocol::backend::query::parse_rows_affected;
use crate::protocol::types::TransactionStatus;
use crate::row::{Column, Row};
use crate::state::StateMachine;
use crate::state::action::Action;
use crate::state::extended::ExtendedQueryStateMachine;
use crate::state::simple_query::SimpleQueryStateMachine;

use super::conn::Conn;

/// The machine behind a cursor.
pub(crate) enum QueryMachine {
    Simple(SimpleQueryStateMachine),
    Extended(ExtendedQueryStateMachine),
}

impl QueryMachine {
    fn columns(&self) -> &Arc<[Column]> {
        match self {
            QueryMachine::Simple(sm) => sm.columns(),
            QueryMachine::Extended(sm) => sm.columns(),
        }
    }

    fn command_tag(&self) -> Option<&str> {
        match self {
            QueryMachine::Simple(sm) => sm.command_tag(),
            QueryMachine::Extended(sm) => sm.command_tag(),
        }
    }

    pub(crate) fn take_lookahead(&mut self) -> bool {
        match self {
            QueryMachine::Simple(_) => false,
            QueryMachine::Extended(sm) => sm.take_lookahead(),
        }
    }
}

impl StateMachine for QueryMachine {
    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        match self {
            QueryMachine::Simple(sm) => sm.step(buffer_set),
            QueryMachine::Extended(sm) => sm.step(buffer_set),
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        match self {
            QueryMachine::Simple(sm) => sm.transaction_status(),
            QueryMachine::Extended(sm) => sm.transaction_status(),
        }
    }

    fn is_finished(&self) -> bool {
        match self {
            QueryMachine::Simple(sm) => sm.is_finished(),
            QueryMachine::Extended(sm) => sm.is_finished(),
        }
    }
}

/// A result set read ahead by [`Cursor::has_next_result_set`].
enum Pending {
    Rows(Arc<[Column]>),
    Done(Option<String>),
}

/// Cursor state, kept apart from the connection borrow.
pub(crate) struct Cursor {
    machine: QueryMachine,
    columns: Arc<[Column]>,
    command_tag: Option<String>,
    /// Rows of the current result set may still follow.
    in_result: bool,
    pending: Option<Pending>,
    finished: bool,
    /// Result sets completed so far.
    completed: usize,
}

fn unexpected(action: &Action) -> Error {
    Error::Protocol(format!("unexpected {action:?} in result stream"))
}

impl Cursor {
    /// Send the request and advance to the first result set.
    pub(crate) async fn start(conn: &mut Conn, machine: QueryMachine) -> Result<Self> {
        let mut cursor = Self {
            machine,
            columns: Arc::from(Vec::new()),
            command_tag: None,
            in_result: false,
            pending: None,
            finished: false,
            completed: 0,
        };
        match cursor.step(conn).await? {
            Action::ResultStart => {
                cursor.columns = Arc::clone(cursor.machine.columns());
                cursor.in_result = true;
            }
            Action::ResultEnd => cursor.end_result(),
            Action::Finished => {}
            other => return Err(unexpected(&other)),
        }
        Ok(cursor)
    }

    async fn step(&mut self, conn: &mut Conn) -> Result<Action> {
        let result = conn.advance(&mut self.machine).await;
        match &result {
            Ok(Action::Finished) => self.finished = true,
            Err(_) if self.machine.is_finished() => {
                self.finished = true;
                self.in_result = false;
                self.pending = None;
            }
            _ => {}
        }
        result
    }

    fn end_result(&mut self) {
        self.in_result = false;
        self.command_tag = self.machine.command_tag().map(str::to_string);
        self.completed += 1;
    }

    async fn next_row(&mut self, conn: &mut Conn) -> Result<Option<Row>> {
        if !self.in_result {
            return Ok(None);
        }
        match self.step(conn).await? {
            Action::Row => Row::new(Arc::clone(&self.columns), &conn.buffer_set.read_buffer).map(Some),
            Action::ResultEnd => {
                self.end_result();
                Ok(None)
            }
            other => Err(unexpected(&other)),
        }
    }

    async fn has_next_result_set(&mut self, conn: &mut Conn) -> Result<bool> {
        if self.pending.is_some() {
            return Ok(true);
        }
        while self.in_result {
            self.next_row(conn).await?;
        }
        if self.finished {
            return Ok(false);
        }
        match self.step(conn).await? {
            Action::ResultStart => {
                self.pending = Some(Pending::Rows(Arc::clone(self.machine.columns())));
                Ok(true)
            }
            Action::ResultEnd => {
                self.completed += 1;
                self.pending = Some(Pending::Done(self.machine.command_tag().map(str::to_string)));
                Ok(true)
            }
            Action::Finished => Ok(false),
            other => Err(unexpected(&other)),
        }
    }

    async fn next_result_set(&mut self, conn: &mut Conn) -> Result<bool> {
        if !self.has_next_result_set(conn).await? {
            return Ok(false);
        }
        match self.pending.take() {
            Some(Pending::Rows(columns)) => {
                self.columns = columns;
                self.command_tag = None;
                self.in_result = true;
            }
            Some(Pending::Done(tag)) => {
                self.columns = Arc::from(Vec::new());
                self.command_tag = tag;
                self.in_result = false;
            }
            None => {}
        }
        Ok(true)
    }
}

/// Rows of a running query.
///
/// Holds the connection until dropped. Dropping early is allowed: the
/// next operation on the connection skips the unread rest first.
///
/// ```no_run
/// # async fn demo(conn: &mut zero_gauss::tokio::Conn) -> zero_gauss::Result<()> {
/// let mut rows = conn.query("select $1::int4 + 1", (41_i32,)).await?;
/// while let Some(row) = rows.next().await? {
///     let n: i32 = row.get(0)?;
///     println!("{n}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct Rows<'a> {
    conn: &'a mut Conn,
    cursor: Cursor,
}

impl<'a> Rows<'a> {
    pub(crate) fn new(conn: &'a mut Conn, cursor: Cursor) -> Self {
        Self { conn, cursor }
    }

    /// Columns of the current result set; empty for statements without rows.
    pub fn columns(&self) -> &[Column] {
        &self.cursor.columns
    }

    /// Next row of the current result set, or `None` at its end.
    pub async fn next(&mut self) -> Result<Option<Row>> {
        let result = self.cursor.next_row(self.conn).await;
        self.conn.mark_broken(result)
    }

    /// Decode the remaining rows of the current result set.
    pub async fn collect<T: for<'r> FromRow<'r>>(&mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        while let Some(row) = self.next().await? {
            out.push(row.decode::<T>()?);
        }
        Ok(out)
    }

    /// Whether another result set follows. Skips unread rows of the current one.
    pub async fn has_next_result_set(&mut self) -> Result<bool> {
        let result = self.cursor.has_next_result_set(self.conn).await;
        self.conn.mark_broken(result)
    }

    /// Move to the next result set; `false` once all are consumed.
    pub async fn next_result_set(&mut self) -> Result<bool> {
        let result = self.cursor.next_result_set(self.conn).await;
        self.conn.mark_broken(result)
    }

    /// Tag of the current result set once its rows are consumed.
    pub fn command_tag(&self) -> Option<&str> {
        self.cursor.command_tag.as_deref()
    }

    /// Rows affected according to [`Self::command_tag`].
    pub fn rows_affected(&self) -> Result<Option<u64>> {
        match self.command_tag() {
            Some(tag) => parse_rows_affected(tag),
            None => Ok(None),
        }
    }

    /// Read everything up to ReadyForQuery.
    ///
    /// Afterwards [`Self::command_tag`] reports the last statement.
    pub async fn close(&mut self) -> Result<()> {
        while self.next_result_set().await? {}
        Ok(())
    }

    pub(crate) fn result_sets_seen(&self) -> usize {
        self.cursor.completed
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Conn {
        self.conn
    }
}
