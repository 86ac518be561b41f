//! Error types for HTTP connection handling.
//!
//! [`HttpError`] is the top-level error a connection task can surface. It
//! wraps [`ParseError`] (request side), [`SendError`] (response side) and
//! [`HandlerError`] (user handler failures escaping the safe-mode shield).
//! Transport-level failures never reach the caller; they resolve internally
//! to a canned response or a logged close.

use std::io;
use thiserror::Error;

/// The top-level error type for a connection task.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Errors that occur while parsing the incoming request
    #[error("request error: {source}")]
    RequestError {
        #[from]
        source: ParseError,
    },

    /// Errors that occur while encoding or sending the response
    #[error("response error: {source}")]
    ResponseError {
        #[from]
        source: SendError,
    },

    /// A handler callback failed with the safe-mode shield disabled
    #[error("handler error: {source}")]
    HandlerError {
        #[from]
        source: HandlerError,
    },
}

/// Errors that occur during HTTP request parsing.
///
/// Every variant resolves to the malformed-request path: keep-alive is
/// forced off and a stock 400 reply is sent before the connection closes.
#[derive(Error, Debug)]
pub enum ParseError {
    /// Header block exceeds the maximum allowed size
    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    /// Number of headers exceeds the maximum allowed
    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    /// Invalid header format or content
    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    /// Unsupported HTTP version
    #[error("invalid http version: {0:?}")]
    InvalidVersion(Option<u8>),

    /// Invalid or unsupported HTTP method
    #[error("invalid http method")]
    InvalidMethod,

    /// Invalid URI format
    #[error("invalid http uri")]
    InvalidUri,

    /// Invalid Content-Length header
    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },
}

impl ParseError {
    /// Creates a new TooLargeHeader error
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    /// Creates a new TooManyHeaders error
    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    /// Creates a new InvalidHeader error
    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    /// Creates a new InvalidContentLength error
    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }
}

/// Errors that occur while encoding a response head.
#[derive(Error, Debug)]
pub enum SendError {
    /// The response carries an HTTP version this core cannot serialize
    #[error("unsupported http version: {version:?}")]
    UnsupportedVersion { version: http::Version },

    /// I/O error during sending
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    /// Creates a new UnsupportedVersion error
    pub fn unsupported_version(version: http::Version) -> Self {
        Self::UnsupportedVersion { version }
    }
}

/// A failure reported by (or caught around) a user request handler.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The handler returned an unrecoverable failure
    #[error("handler failed: {reason}")]
    Failed { reason: String },

    /// The handler panicked inside the safe-mode shield
    #[error("handler panicked: {reason}")]
    Panicked { reason: String },
}

impl HandlerError {
    /// Creates a new Failed error
    pub fn failed<S: ToString>(str: S) -> Self {
        Self::Failed { reason: str.to_string() }
    }

    /// Creates a new Panicked error
    pub fn panicked<S: ToString>(str: S) -> Self {
        Self::Panicked { reason: str.to_string() }
    }
}
