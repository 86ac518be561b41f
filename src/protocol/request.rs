//! HTTP request header handling.
//!
//! Wraps the standard `http::Request` type and adds the two pieces of
//! request metadata the connection state machine acts on: the keep-alive
//! disposition and the declared body length.

use http::request::Parts;
use http::{header, HeaderMap, Method, Request, Uri, Version};

use crate::protocol::ParseError;

/// An HTTP request header, without its body.
///
/// The body never materializes as an object; its bytes are streamed to the
/// request handler as they arrive on the transport.
#[derive(Debug)]
pub struct RequestHeader {
    inner: Request<()>,
}

impl AsRef<Request<()>> for RequestHeader {
    fn as_ref(&self) -> &Request<()> {
        &self.inner
    }
}

impl RequestHeader {
    /// Consumes the header and returns the inner `Request<()>`.
    pub fn into_inner(self) -> Request<()> {
        self.inner
    }

    /// Returns a reference to the request's HTTP method.
    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    /// Returns a reference to the request's URI.
    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    /// Returns the request's HTTP version.
    pub fn version(&self) -> Version {
        self.inner.version()
    }

    /// Returns a reference to the request's headers.
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Whether the client asked for the connection to survive this request.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is sent;
    /// HTTP/1.0 requires an explicit `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        let connection = self
            .headers()
            .get(header::CONNECTION)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_ascii_lowercase());

        match self.version() {
            Version::HTTP_11 => !matches!(connection.as_deref(), Some(v) if v.contains("close")),
            Version::HTTP_10 => matches!(connection.as_deref(), Some(v) if v.contains("keep-alive")),
            _ => false,
        }
    }

    /// The declared body length, `None` when absent.
    ///
    /// A `Content-Length` that does not parse as `u64`, or one combined with
    /// `Transfer-Encoding`, makes the request malformed.
    pub fn content_length(&self) -> Result<Option<u64>, ParseError> {
        let value = match self.headers().get(header::CONTENT_LENGTH) {
            Some(value) => value,
            None => return Ok(None),
        };

        // refer: https://www.rfc-editor.org/rfc/rfc7230#section-3.3
        if self.headers().get(header::TRANSFER_ENCODING).is_some() {
            return Err(ParseError::invalid_content_length(
                "transfer_encoding and content_length both present in headers",
            ));
        }

        let str = value.to_str().map_err(|_| ParseError::invalid_content_length("value can't to_str"))?;

        let length = str
            .trim()
            .parse::<u64>()
            .map_err(|_| ParseError::invalid_content_length(format!("value {str} is not u64")))?;

        Ok(Some(length))
    }
}

/// Converts request parts into a RequestHeader.
impl From<Parts> for RequestHeader {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Request::from_parts(parts, ()) }
    }
}

/// Converts a bodyless request into a RequestHeader.
impl From<Request<()>> for RequestHeader {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}
