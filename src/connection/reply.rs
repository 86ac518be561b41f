use std::io;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::{header, HeaderValue};
use tokio::sync::mpsc;
use tracing::error;

use crate::codec::to_buffers;
use crate::connection::outgoing::{BufferInfo, OutgoingQueue, WriteCallback};
use crate::protocol::ResponseHead;

/// Operations posted onto the connection's driving task from other threads.
/// Posting (never executing inline) is what keeps all state-machine
/// mutations single-threaded on that task.
pub(crate) enum Op {
    WantMore,
    Close(Option<io::Error>),
    WriteArmed,
}

/// The capability a connection injects into its request handler.
///
/// Every method is callable from any thread. `send_headers` and `send_data`
/// enqueue outbound messages directly; `want_more` and `close` post their
/// effect onto the connection task and return immediately.
pub trait ReplyStream: Send + Sync {
    /// Enqueues a response head plus an optional first body slice. The
    /// callback fires once those bytes are on the wire, or with the error
    /// that stopped them.
    fn send_headers(&self, response: ResponseHead, content: Bytes, callback: Option<WriteCallback>);

    /// Enqueues body bytes.
    fn send_data(&self, data: Bytes, callback: Option<WriteCallback>);

    /// Signals readiness to accept more `on_data` after backpressure.
    fn want_more(&self);

    /// Terminates the logical request: `None` for normal completion,
    /// `Some(err)` to force an error close.
    fn close(&self, err: Option<io::Error>);
}

/// State shared between the connection task and handler-side senders: the
/// outgoing queue, the ops channel, and the two per-request flags the
/// senders need (keep-alive disposition, access-log status).
pub(crate) struct ConnShared {
    pub(crate) outgoing: Mutex<OutgoingQueue>,
    pub(crate) ops: mpsc::UnboundedSender<Op>,
    pub(crate) keep_alive: AtomicBool,
    pub(crate) status: AtomicU16,
}

impl ConnShared {
    pub fn new(ops: mpsc::UnboundedSender<Op>) -> Self {
        Self {
            outgoing: Mutex::new(OutgoingQueue::default()),
            ops,
            keep_alive: AtomicBool::new(false),
            status: AtomicU16::new(0),
        }
    }

    pub(crate) fn send_headers_impl(&self, mut head: ResponseHead, content: Bytes, callback: Option<WriteCallback>) {
        self.status.store(head.status().as_u16(), Ordering::Relaxed);

        if self.keep_alive.load(Ordering::Relaxed) {
            head.headers_mut().insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        }

        match to_buffers(&head, content) {
            Ok(buffers) => self.enqueue(BufferInfo::new(buffers, callback)),
            Err(e) => {
                error!(cause = %e, "failed to encode response head");
                if let Some(callback) = callback {
                    callback(Err(io::Error::new(io::ErrorKind::InvalidInput, e.to_string())));
                }
            }
        }
    }

    pub(crate) fn send_data_impl(&self, data: Bytes, callback: Option<WriteCallback>) {
        self.enqueue(BufferInfo::single(data, callback));
    }

    /// Appends an outbound message and wakes the connection task when no
    /// write was in flight. Messages with no payload complete immediately;
    /// messages enqueued after teardown fail immediately.
    pub(crate) fn enqueue(&self, mut info: BufferInfo) {
        if info.is_empty() {
            if let Some(callback) = info.take_callback() {
                callback(Ok(()));
            }
            return;
        }

        let arm = {
            let mut outgoing = self.outgoing.lock().unwrap();
            if outgoing.closed {
                drop(outgoing);
                if let Some(callback) = info.take_callback() {
                    callback(Err(closed_error()));
                }
                return;
            }
            outgoing.push(info)
        };

        if arm {
            let _ = self.ops.send(Op::WriteArmed);
        }
    }
}

pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed")
}

/// Concrete [`ReplyStream`] handed to handlers; a thin veneer over the
/// shared connection state.
pub(crate) struct ReplyHandle {
    shared: Arc<ConnShared>,
}

impl ReplyHandle {
    pub fn new(shared: Arc<ConnShared>) -> Self {
        Self { shared }
    }
}

impl ReplyStream for ReplyHandle {
    fn send_headers(&self, response: ResponseHead, content: Bytes, callback: Option<WriteCallback>) {
        self.shared.send_headers_impl(response, content, callback);
    }

    fn send_data(&self, data: Bytes, callback: Option<WriteCallback>) {
        self.shared.send_data_impl(data, callback);
    }

    fn want_more(&self) {
        let _ = self.shared.ops.send(Op::WantMore);
    }

    fn close(&self, err: Option<io::Error>) {
        let _ = self.shared.ops.send(Op::Close(err));
    }
}
