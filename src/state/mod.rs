//! Sans-I/O state machines for the wire protocol.
//!
//! The machines never touch a socket. Each `step()` inspects the message
//! in the [`BufferSet`] and returns an [`Action`] telling the caller what
//! I/O to perform next.

pub mod action;
pub mod connection;
pub mod extended;
pub mod simple_query;

pub use action::{Action, AsyncMessage};
pub use connection::{ConnectionState, ConnectionStateMachine};
pub use extended::{CloseStatementStateMachine, ExtendedQueryStateMachine, PrepareStateMachine};
pub use simple_query::SimpleQueryStateMachine;

use crate::buffer_set::BufferSet;
use crate::error::Result;
use crate::protocol::types::TransactionStatus;

/// A query-phase machine driven by the connection until ReadyForQuery.
pub trait StateMachine {
    /// Advance using the message in `buffer_set`.
    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action>;

    /// Status from the final ReadyForQuery.
    fn transaction_status(&self) -> TransactionStatus;

    /// Whether ReadyForQuery has been consumed.
    fn is_finished(&self) -> bool;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::types::Oid;

    /// Load a message and step once, expecting success.
    pub(crate) fn feed<S: StateMachine>(
        sm: &mut S,
        bs: &mut BufferSet,
        type_byte: u8,
        payload: &[u8],
    ) -> Action {
        bs.load(type_byte, payload);
        sm.step(bs).unwrap()
    }

    /// RowDescription payload with text-format columns.
    pub(crate) fn row_description_payload(columns: &[(&str, Oid)]) -> Vec<u8> {
        let mut payload = (columns.len() as u16).to_be_bytes().to_vec();
        for (name, oid) in columns {
            payload.extend_from_slice(name.as_bytes());
            payload.push(0);
            payload.extend_from_slice(&0_u32.to_be_bytes());
            payload.extend_from_slice(&0_i16.to_be_bytes());
            payload.extend_from_slice(&oid.to_be_bytes());
            payload.extend_from_slice(&(-1_i16).to_be_bytes());
            payload.extend_from_slice(&(-1_i32).to_be_bytes());
            payload.extend_from_slice(&0_u16.to_be_bytes());
        }
        payload
    }

    pub(crate) fn data_row_payload(values: &[Option<&[u8]>]) -> Vec<u8> {
        crate::row::tests::data_row(values)
    }
}
