//! Ledger daemon: serves ledger operations as JSON lines.
//!
//! One request object per input line, one response object per output line,
//! in order. See [`protocol`] for the message shapes.

pub mod protocol;
pub mod server;

pub use protocol::{ErrorBody, Operation, Outcome, Request, Response};
pub use server::{handle, handle_line, serve};
