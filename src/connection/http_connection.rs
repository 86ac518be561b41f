use std::any::Any;
use std::cmp;
use std::io;
use std::io::IoSlice;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::codec::{stock, ParseStatus, RequestParser};
use crate::connection::access_log::AccessLog;
use crate::connection::reply::closed_error;
use crate::connection::{ConnShared, Op, ReplyHandle, State, GATHER_LIMIT};
use crate::handler::RequestHandler;
use crate::protocol::{HandlerError, HttpError, ParseError};
use crate::server::ServerShared;

/// The state machine owning one accepted socket.
///
/// A connection is driven by a single task ([`Connection::run`]): every
/// state mutation, parser step and handler callback happens there, so none
/// of them need locking. The task suspends in exactly two places, the
/// in-flight read and the in-flight vectorized write, and additionally
/// wakes for operations posted from other threads through the handler's
/// reply stream (`want_more`, `close`, newly armed writes).
///
/// Request bytes land in a fixed receive buffer; the subrange delivered by
/// the transport but not yet consumed by parser or handler is tracked as
/// the unprocessed window across suspensions, which is what makes
/// handler-controlled backpressure and keep-alive pipelining work without
/// copying.
pub struct Connection<R, W> {
    reader: R,
    writer: W,
    buffer: Box<[u8]>,
    /// (begin, end) indexes into `buffer`: delivered but not yet consumed
    unprocessed: (usize, usize),
    at_read: bool,
    state: State,
    content_length: u64,
    keep_alive: bool,
    close_after_flush: bool,
    on_close_sent: bool,
    parser: RequestParser,
    handler: Option<Box<dyn RequestHandler>>,
    access: AccessLog,
    server: Arc<ServerShared>,
    shared: Arc<ConnShared>,
    ops_rx: mpsc::UnboundedReceiver<Op>,
    term_error: Option<io::Error>,
}

enum Event {
    Op(Op),
    Read(io::Result<usize>),
    Wrote(io::Result<usize>),
}

enum Step {
    Continue,
    Stop,
}

#[derive(Clone, Copy)]
enum Cleanup {
    /// Log the fault and carry on; used where teardown is already underway
    None,
    /// Tear the connection down: drop the handler and stop the task
    Error,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, local: String, remote: String, server: Arc<ServerShared>) -> Self {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        server.connection_opened();
        debug!(%local, %remote, "opened connection");
        let buffer_size = server.buffer_size();
        Self {
            reader,
            writer,
            buffer: vec![0u8; buffer_size].into_boxed_slice(),
            unprocessed: (0, 0),
            at_read: false,
            state: State::initial(),
            content_length: 0,
            keep_alive: false,
            close_after_flush: false,
            on_close_sent: false,
            parser: RequestParser::new(),
            handler: None,
            access: AccessLog::new(local, remote),
            server,
            shared: Arc::new(ConnShared::new(ops_tx)),
            ops_rx,
            term_error: None,
        }
    }

    /// Drives the connection until the peer goes away, keep-alive ends, or
    /// an unshielded handler failure surfaces.
    ///
    /// Transport errors never propagate: they resolve internally to a
    /// canned response or a logged close.
    pub async fn run(mut self) -> Result<(), HttpError> {
        self.async_read();
        let result = loop {
            let event = self.next_event().await;
            let step = match event {
                Event::Op(Op::WantMore) => self.want_more_impl(),
                Event::Op(Op::Close(err)) => self.close_impl(err),
                Event::Op(Op::WriteArmed) => Ok(Step::Continue),
                Event::Read(read) => self.handle_read(read),
                Event::Wrote(wrote) => self.write_finished(wrote),
            };
            match step {
                Ok(Step::Continue) => {}
                Ok(Step::Stop) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.finish().await;
        result
    }

    async fn next_event(&mut self) -> Event {
        let at_read = self.at_read;
        let sending = self.shared.outgoing.lock().unwrap().sending;
        let Connection { reader, writer, buffer, ops_rx, shared, .. } = self;
        tokio::select! {
            biased;
            op = ops_rx.recv() => Event::Op(op.expect("connection keeps an ops sender alive")),
            wrote = write_some(writer, shared), if sending => Event::Wrote(wrote),
            read = reader.read(&mut buffer[..]), if at_read => Event::Read(read),
        }
    }

    /// Final teardown: refuse new outbound messages, fail whatever never
    /// reached the wire, half-close the transport.
    async fn finish(&mut self) {
        let callbacks = {
            let mut outgoing = self.shared.outgoing.lock().unwrap();
            outgoing.closed = true;
            outgoing.drain()
        };
        if !callbacks.is_empty() {
            let kind = self.term_error.as_ref().map(|e| e.kind()).unwrap_or(io::ErrorKind::ConnectionAborted);
            for callback in callbacks {
                callback(Err(io::Error::new(kind, "connection closed")));
            }
        }
        let _ = self.writer.shutdown().await;
    }
}

/// One vectorized write against the front of the outgoing queue. The
/// gathered ranges are refcounted handles cloned out under the lock, so the
/// lock is never held across the write itself.
async fn write_some<W>(writer: &mut W, shared: &Arc<ConnShared>) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut gathered: Vec<Bytes> = Vec::with_capacity(GATHER_LIMIT);
    shared.outgoing.lock().unwrap().gather(&mut gathered);
    debug_assert!(!gathered.is_empty());
    let slices: Vec<IoSlice<'_>> = gathered.iter().map(|buffer| IoSlice::new(buffer)).collect();
    writer.write_vectored(&slices).await
}

impl<R, W> Connection<R, W> {
    /// Arms a read. Idempotent: a no-op while a read is in flight. The
    /// unprocessed window must be empty by now since a read overwrites the
    /// buffer; resetting it here makes that an invariant.
    fn async_read(&mut self) {
        if self.at_read {
            return;
        }
        self.at_read = true;
        self.unprocessed = (0, 0);
    }

    fn handle_read(&mut self, result: io::Result<usize>) -> Result<Step, HttpError> {
        self.at_read = false;
        match result {
            Ok(0) => self.read_failed(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed connection")),
            Ok(n) => {
                debug!(bytes = n, state = ?self.state, "read completed");
                self.process_data(0, n)
            }
            Err(e) => self.read_failed(e),
        }
    }

    fn read_failed(&mut self, err: io::Error) -> Result<Step, HttpError> {
        debug!(cause = %err, state = ?self.state, "read failed");
        self.shared.status.store(499, Ordering::Relaxed);
        self.print_access_log();
        self.notify_close("read failure", Some(&err), Cleanup::None)?;
        self.drop_handler();
        self.term_error = Some(err);
        Ok(Step::Stop)
    }

    /// Feeds `buffer[begin..end]` through the state machine: header
    /// parsing, then body delivery into the handler. Loops instead of
    /// recursing so body bytes that arrived with the head (and pipelined
    /// next requests) are handled without another round-trip through the
    /// transport.
    fn process_data(&mut self, mut begin: usize, end: usize) -> Result<Step, HttpError> {
        debug!(size = end - begin, state = ?self.state, "processing data");
        loop {
            if self.state.contains(State::READ_HEADERS) {
                if self.state.contains(State::WAITING_FIRST_DATA) {
                    self.state.remove(State::WAITING_FIRST_DATA);
                    self.access.arm();
                }

                let (status, consumed) = match self.parser.advance(&self.buffer[begin..end]) {
                    Ok(outcome) => outcome,
                    Err(e) => return self.reject_malformed(e),
                };
                self.access.received += consumed as u64;
                begin += consumed;

                let header = match status {
                    ParseStatus::Incomplete => {
                        self.async_read();
                        return Ok(Step::Continue);
                    }
                    ParseStatus::Complete(header) => header,
                };

                self.access.record_request(header.method(), header.uri());
                self.content_length = match header.content_length() {
                    Ok(length) => length.unwrap_or(0),
                    Err(e) => return self.reject_malformed(e),
                };
                self.keep_alive = header.is_keep_alive();
                self.shared.keep_alive.store(self.keep_alive, Ordering::Relaxed);

                match self.server.factory(&header) {
                    Some(factory) => {
                        self.server.handler_created();
                        let mut handler = factory.create();
                        handler.initialize(Arc::new(ReplyHandle::new(self.shared.clone())));
                        match guarded(self.server.safe_mode(), || handler.on_headers(header)) {
                            Invoked::Ok(()) => self.handler = Some(handler),
                            Invoked::Err(e) => {
                                self.handler = Some(handler);
                                return Err(e.into());
                            }
                            Invoked::Fault(reason) => {
                                drop(handler);
                                self.record_fault("on_headers", reason);
                                return self.fault_teardown();
                            }
                        }
                    }
                    None => self.send_error(StatusCode::NOT_FOUND),
                }

                self.state.remove(State::READ_HEADERS);
                self.state.insert(State::READ_DATA);
                // loop again so body bytes already buffered are delivered
            } else if self.state.contains(State::READ_DATA) {
                let available = end - begin;
                let from_body = cmp::min(self.content_length, available as u64) as usize;
                let mut processed = from_body;

                if from_body > 0 {
                    if let Some(mut handler) = self.handler.take() {
                        let invoked = {
                            let data = &self.buffer[begin..begin + from_body];
                            guarded(self.server.safe_mode(), || handler.on_data(data))
                        };
                        match invoked {
                            Invoked::Ok(n) => {
                                self.handler = Some(handler);
                                processed = cmp::min(n, from_body);
                            }
                            Invoked::Err(e) => {
                                self.handler = Some(handler);
                                return Err(e.into());
                            }
                            Invoked::Fault(reason) => {
                                drop(handler);
                                self.record_fault("on_data", reason);
                                return self.fault_teardown();
                            }
                        }
                    }
                }

                self.content_length -= processed as u64;
                self.access.received += processed as u64;

                if processed != from_body {
                    debug!(processed, offered = from_body, "handler applied backpressure");
                    self.unprocessed = (begin + processed, end);
                    return Ok(Step::Continue);
                } else if self.content_length > 0 {
                    self.async_read();
                    return Ok(Step::Continue);
                } else {
                    self.state.remove(State::READ_DATA);
                    self.unprocessed = (begin + processed, end);
                    debug!(unprocessed = end - (begin + processed), state = ?self.state, "request body complete");

                    if let Step::Stop = self.notify_close("body complete", None, Cleanup::Error)? {
                        return Ok(Step::Stop);
                    }
                    if self.state.contains(State::REQUEST_PROCESSED) {
                        self.drop_handler();
                        return self.process_next();
                    }
                    // the handler still owes the response; wait for close()
                    return Ok(Step::Continue);
                }
            } else {
                // response pending; nothing consumes data in this phase
                return Ok(Step::Continue);
            }
        }
    }

    fn reject_malformed(&mut self, cause: ParseError) -> Result<Step, HttpError> {
        warn!(cause = %cause, "rejecting malformed request");
        self.keep_alive = false;
        self.shared.keep_alive.store(false, Ordering::Relaxed);
        self.unprocessed = (0, 0);
        self.state = State::PROCESSING;
        self.send_error(StatusCode::BAD_REQUEST);
        Ok(Step::Continue)
    }

    /// Enqueues a stock reply whose completion drives the close path, so
    /// the connection goes down only after the reply flushes.
    fn send_error(&mut self, status: StatusCode) {
        debug!(status = %status, state = ?self.state, "sending stock reply");
        let (head, body) = stock::stock_reply(status);
        let ops = self.shared.ops.clone();
        self.shared.send_headers_impl(
            head,
            body,
            Some(Box::new(move |result| {
                let _ = ops.send(Op::Close(result.err()));
            })),
        );
    }

    fn want_more_impl(&mut self) -> Result<Step, HttpError> {
        debug!(state = ?self.state, "resuming input");
        let (begin, end) = self.unprocessed;
        if begin != end {
            self.process_data(begin, end)
        } else {
            self.async_read();
            Ok(Step::Continue)
        }
    }

    fn write_finished(&mut self, result: io::Result<usize>) -> Result<Step, HttpError> {
        match result {
            Err(e) => {
                debug!(cause = %e, "write failed");
                let callbacks = self.shared.outgoing.lock().unwrap().drain();
                for callback in callbacks {
                    callback(Err(io::Error::new(e.kind(), e.to_string())));
                }
                self.shared.status.store(499, Ordering::Relaxed);
                self.notify_close("write failure", Some(&e), Cleanup::None)?;
                self.close_impl(Some(e))
            }
            Ok(written) => {
                self.access.sent += written as u64;
                let (callbacks, leftover, empty) = {
                    let mut outgoing = self.shared.outgoing.lock().unwrap();
                    let mut fired = Vec::new();
                    let leftover = outgoing.consume(written, &mut fired);
                    let empty = outgoing.is_empty();
                    if empty {
                        outgoing.sending = false;
                    }
                    (fired, leftover, empty)
                };
                for callback in callbacks {
                    callback(Ok(()));
                }
                if leftover > 0 {
                    error!(extra = leftover, "write completed with more bytes than were queued");
                }
                if empty && self.close_after_flush {
                    return Ok(Step::Stop);
                }
                Ok(Step::Continue)
            }
        }
    }

    fn close_impl(&mut self, err: Option<io::Error>) -> Result<Step, HttpError> {
        debug!(err = ?err, state = ?self.state, keep_alive = self.keep_alive, "close requested");

        if let Some(e) = err {
            // 499 marks a client that vanished mid-transfer; anything else
            // is a generic error close
            if self.shared.status.load(Ordering::Relaxed) != 499 {
                self.shared.status.store(599, Ordering::Relaxed);
            }
            self.print_access_log();
            self.drop_handler();
            self.term_error = Some(e);
            return Ok(Step::Stop);
        }

        if self.state != State::PROCESSING {
            // response done before the body was exhausted; keep the handler
            // and keep draining, its input-close will drive the transition
            self.state.insert(State::REQUEST_PROCESSED);
            debug!(remaining = self.content_length, "response finished before request body");
            let (begin, end) = self.unprocessed;
            if begin != end {
                return self.process_data(begin, end);
            }
            self.async_read();
            return Ok(Step::Continue);
        }

        self.drop_handler();

        if !self.keep_alive {
            self.print_access_log();
            return self.stop_after_flush();
        }

        self.process_next()
    }

    /// Resets per-request state and waits for the next pipelined request,
    /// re-feeding any bytes that arrived behind the previous one.
    fn process_next(&mut self) -> Result<Step, HttpError> {
        self.print_access_log();
        self.state = State::initial();
        self.access.reset();
        self.shared.status.store(0, Ordering::Relaxed);
        self.on_close_sent = false;
        self.parser.reset();

        let (begin, end) = self.unprocessed;
        debug!(unprocessed = end - begin, "request complete, awaiting next");
        if begin != end {
            self.process_data(begin, end)
        } else {
            self.async_read();
            Ok(Step::Continue)
        }
    }

    fn stop_after_flush(&mut self) -> Result<Step, HttpError> {
        let draining = self.shared.outgoing.lock().unwrap().sending;
        if draining {
            self.close_after_flush = true;
            Ok(Step::Continue)
        } else {
            Ok(Step::Stop)
        }
    }

    /// Delivers the input-close notification at most once per request.
    fn notify_close(&mut self, context: &'static str, err: Option<&io::Error>, cleanup: Cleanup) -> Result<Step, HttpError> {
        if self.on_close_sent {
            return Ok(Step::Continue);
        }
        let mut handler = match self.handler.take() {
            Some(handler) => handler,
            None => return Ok(Step::Continue),
        };
        self.on_close_sent = true;
        match guarded(self.server.safe_mode(), || handler.on_close(err)) {
            Invoked::Ok(()) => {
                self.handler = Some(handler);
                Ok(Step::Continue)
            }
            Invoked::Err(e) => {
                self.handler = Some(handler);
                Err(e.into())
            }
            Invoked::Fault(reason) => match cleanup {
                Cleanup::None => {
                    self.handler = Some(handler);
                    self.record_fault(context, reason);
                    Ok(Step::Continue)
                }
                Cleanup::Error => {
                    drop(handler);
                    self.record_fault(context, reason);
                    self.fault_teardown()
                }
            },
        }
    }

    fn record_fault(&mut self, context: &'static str, reason: String) {
        error!(context, reason = %reason, "uncaught handler failure");
        self.shared.status.store(598, Ordering::Relaxed);
        self.print_access_log();
    }

    /// Teardown after a fault whose handler has already been discarded.
    fn fault_teardown(&mut self) -> Result<Step, HttpError> {
        self.server.handler_dropped();
        self.term_error = Some(io::Error::new(io::ErrorKind::Other, "handler failure"));
        Ok(Step::Stop)
    }

    fn drop_handler(&mut self) {
        if self.handler.take().is_some() {
            self.server.handler_dropped();
        }
    }

    /// Suppressed entirely when no byte of a request has been seen.
    fn print_access_log(&mut self) {
        if self.state.contains(State::WAITING_FIRST_DATA) {
            return;
        }
        self.access.emit(self.shared.status.load(Ordering::Relaxed));
    }
}

impl<R, W> Drop for Connection<R, W> {
    fn drop(&mut self) {
        self.server.connection_closed();
        debug!("closed connection");

        if let Some(mut handler) = self.handler.take() {
            self.server.handler_dropped();
            self.shared.status.store(597, Ordering::Relaxed);
            self.print_access_log();
            if !self.on_close_sent {
                match guarded(self.server.safe_mode(), || handler.on_close(None)) {
                    Invoked::Ok(()) => {}
                    Invoked::Err(e) => error!(cause = %e, "handler close notification failed"),
                    Invoked::Fault(reason) => {
                        error!(reason = %reason, "uncaught handler failure");
                        self.shared.status.store(598, Ordering::Relaxed);
                        self.print_access_log();
                    }
                }
            }
        }

        // a connection dropped mid-flight still owes its callbacks
        let callbacks = {
            let mut outgoing = self.shared.outgoing.lock().unwrap();
            outgoing.closed = true;
            outgoing.drain()
        };
        for callback in callbacks {
            callback(Err(closed_error()));
        }
    }
}

enum Invoked<T> {
    Ok(T),
    Err(HandlerError),
    Fault(String),
}

/// The safe-mode shield: catches panics and converts failed returns into
/// faults the connection resolves itself. With safe mode off, both surface
/// to the caller unchanged.
fn guarded<T>(safe_mode: bool, call: impl FnOnce() -> Result<T, HandlerError>) -> Invoked<T> {
    if !safe_mode {
        return match call() {
            Ok(value) => Invoked::Ok(value),
            Err(e) => Invoked::Err(e),
        };
    }
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Invoked::Ok(value),
        Ok(Err(e)) => Invoked::Fault(e.to_string()),
        Err(payload) => Invoked::Fault(panic_reason(payload.as_ref())),
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("unknown panic")
    }
}
