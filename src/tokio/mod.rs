//! Asynchronous client using Tokio.

mod cancel;
mod conn;
mod connect;
mod copy;
mod rows;
mod stream;

pub use cancel::CancelToken;
pub use conn::{Conn, ExecResult};
pub use copy::{CopyIn, copy_in_statement};
pub use rows::Rows;
pub use stream::Stream;
