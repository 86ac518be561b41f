//! Request handler traits and adapters.
//!
//! A [`RequestHandler`] receives exactly one request: `on_headers`, then
//! zero or more `on_data` calls carrying the body in network order, then
//! `on_close`. It answers through the [`ReplyStream`] capability injected
//! by `initialize` before any callback fires.

use std::io;
use std::sync::Arc;

use crate::connection::ReplyStream;
use crate::protocol::{HandlerError, RequestHeader};

mod buffering;
pub use buffering::BufferingHandler;

/// A per-request handler driven by the connection.
pub trait RequestHandler: Send {
    /// Receives the connection's reply capability; called once, before any
    /// other callback.
    fn initialize(&mut self, reply: Arc<dyn ReplyStream>);

    /// Called once when the request head has been parsed.
    fn on_headers(&mut self, request: RequestHeader) -> Result<(), HandlerError>;

    /// Called with the next slice of body bytes; returns how many were
    /// consumed. Returning less than offered applies backpressure: delivery
    /// pauses until `want_more` is called on the reply stream, and the
    /// unconsumed tail is re-offered then.
    fn on_data(&mut self, data: &[u8]) -> Result<usize, HandlerError>;

    /// Called once when the request body is exhausted (`None`) or the
    /// connection failed (`Some(err)`).
    fn on_close(&mut self, err: Option<&io::Error>) -> Result<(), HandlerError>;
}

/// Creates one [`RequestHandler`] per matched request.
pub trait HandlerFactory: Send + Sync {
    fn create(&self) -> Box<dyn RequestHandler>;
}

/// A [`HandlerFactory`] built from a closure.
pub struct FactoryFn<F> {
    f: F,
}

impl<F, H> HandlerFactory for FactoryFn<F>
where
    F: Fn() -> H + Send + Sync,
    H: RequestHandler + 'static,
{
    fn create(&self) -> Box<dyn RequestHandler> {
        Box::new((self.f)())
    }
}

pub fn make_factory<F, H>(f: F) -> FactoryFn<F>
where
    F: Fn() -> H + Send + Sync,
    H: RequestHandler + 'static,
{
    FactoryFn { f }
}
