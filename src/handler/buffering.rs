use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::connection::ReplyStream;
use crate::handler::RequestHandler;
use crate::protocol::{HandlerError, RequestHeader, ResponseHead};

/// A convenience handler that buffers the complete request body, asks the
/// wrapped closure for a response, and sends it in one message.
///
/// Suited to small request/response pairs; handlers that stream either
/// direction should implement [`RequestHandler`] directly.
pub struct BufferingHandler<F> {
    respond: F,
    reply: Option<Arc<dyn ReplyStream>>,
    request: Option<RequestHeader>,
    body: BytesMut,
}

impl<F> BufferingHandler<F>
where
    F: Fn(&RequestHeader, Bytes) -> (ResponseHead, Bytes) + Send,
{
    pub fn new(respond: F) -> Self {
        Self { respond, reply: None, request: None, body: BytesMut::new() }
    }
}

impl<F> RequestHandler for BufferingHandler<F>
where
    F: Fn(&RequestHeader, Bytes) -> (ResponseHead, Bytes) + Send,
{
    fn initialize(&mut self, reply: Arc<dyn ReplyStream>) {
        self.reply = Some(reply);
    }

    fn on_headers(&mut self, request: RequestHeader) -> Result<(), HandlerError> {
        self.request = Some(request);
        Ok(())
    }

    fn on_data(&mut self, data: &[u8]) -> Result<usize, HandlerError> {
        self.body.extend_from_slice(data);
        Ok(data.len())
    }

    fn on_close(&mut self, err: Option<&io::Error>) -> Result<(), HandlerError> {
        if err.is_some() {
            return Ok(());
        }
        let reply = self.reply.take().ok_or_else(|| HandlerError::failed("reply stream missing"))?;
        let request = self.request.take().ok_or_else(|| HandlerError::failed("request head missing"))?;
        let (head, body) = (self.respond)(&request, self.body.split().freeze());
        reply.send_headers(head, body, None);
        reply.close(None);
        Ok(())
    }
}
