//! Canned replies the connection sends on its own behalf: bad request,
//! not found, internal error. Each carries a minimal HTML body so
//! command-line clients and browsers both render something sensible.

use bytes::Bytes;
use http::{header, Response, StatusCode};

use crate::protocol::ResponseHead;

const BAD_REQUEST: &[u8] = b"<html><head><title>Bad Request</title></head><body><h1>400 Bad Request</h1></body></html>";
const NOT_FOUND: &[u8] = b"<html><head><title>Not Found</title></head><body><h1>404 Not Found</h1></body></html>";
const INTERNAL_SERVER_ERROR: &[u8] =
    b"<html><head><title>Internal Server Error</title></head><body><h1>500 Internal Server Error</h1></body></html>";

/// A ready-to-send reply for the given status: head plus body slice.
pub fn stock_reply(status: StatusCode) -> (ResponseHead, Bytes) {
    let body = stock_body(status);
    let head = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/html")
        .header(header::CONTENT_LENGTH, body.len())
        .body(())
        .unwrap();
    (head, body)
}

fn stock_body(status: StatusCode) -> Bytes {
    match status {
        StatusCode::BAD_REQUEST => Bytes::from_static(BAD_REQUEST),
        StatusCode::NOT_FOUND => Bytes::from_static(NOT_FOUND),
        _ => Bytes::from_static(INTERNAL_SERVER_ERROR),
    }
}
