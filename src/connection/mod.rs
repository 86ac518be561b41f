//! The per-connection HTTP/1.1 state machine.
//!
//! One [`Connection`] instance owns one accepted socket and drives the full
//! request lifecycle on a single task: incremental head parsing, streaming
//! the body into the request handler with handler-controlled backpressure,
//! concurrent response transmission from a cross-thread outgoing queue,
//! keep-alive pipelining, and teardown with exactly-once completion
//! callbacks and one access-log line per request.
//!
//! Handlers talk back through the [`ReplyStream`] capability; everything it
//! enqueues is flushed by the connection task with vectorized writes.

mod access_log;
mod http_connection;
mod outgoing;
mod reply;
mod state;

pub use http_connection::Connection;
pub use outgoing::BufferInfo;
pub use outgoing::WriteCallback;
pub use reply::ReplyStream;

pub(crate) use outgoing::GATHER_LIMIT;
pub(crate) use reply::{ConnShared, Op, ReplyHandle};
pub(crate) use state::State;
