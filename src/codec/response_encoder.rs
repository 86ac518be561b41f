use bytes::{BufMut, Bytes, BytesMut};
use http::Version;
use tracing::error;

use crate::protocol::{ResponseHead, SendError};

const INIT_HEAD_SIZE: usize = 4 * 1024;

/// Serializes a response head into one contiguous byte range:
/// status line, headers, terminating CRLF.
///
/// Headers are written exactly as the caller set them; this core does not
/// invent Content-Length or transfer-coding headers on the caller's behalf.
pub fn encode_head(head: &ResponseHead) -> Result<Bytes, SendError> {
    let mut dst = BytesMut::with_capacity(INIT_HEAD_SIZE);

    match head.version() {
        Version::HTTP_11 => dst.put_slice(b"HTTP/1.1 "),
        Version::HTTP_10 => dst.put_slice(b"HTTP/1.0 "),
        v => {
            error!(http_version = ?v, "unsupported http version");
            return Err(SendError::unsupported_version(v));
        }
    }
    dst.put_slice(head.status().as_str().as_bytes());
    dst.put_slice(b" ");
    dst.put_slice(head.status().canonical_reason().unwrap_or("Unknown").as_bytes());
    dst.put_slice(b"\r\n");

    for (header_name, header_value) in head.headers().iter() {
        dst.put_slice(header_name.as_ref());
        dst.put_slice(b": ");
        dst.put_slice(header_value.as_ref());
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");

    Ok(dst.freeze())
}

/// Gathers a response head plus an optional body slice into the byte ranges
/// of one outbound message. The body handle is kept as-is, so caller-owned
/// memory is written without copying.
pub fn to_buffers(head: &ResponseHead, content: Bytes) -> Result<Vec<Bytes>, SendError> {
    let mut buffers = Vec::with_capacity(2);
    buffers.push(encode_head(head)?);
    if !content.is_empty() {
        buffers.push(content);
    }
    Ok(buffers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{header, Response, StatusCode};

    #[test]
    fn head_serialization() {
        let head: ResponseHead = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, 2)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(())
            .unwrap();

        let bytes = encode_head(&head).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 2\r\n"));
        assert!(text.contains("content-type: text/plain\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn body_slice_rides_along_unchanged() {
        let head: ResponseHead = Response::builder().status(StatusCode::OK).body(()).unwrap();
        let body = Bytes::from_static(b"payload");

        let buffers = to_buffers(&head, body.clone()).unwrap();
        assert_eq!(buffers.len(), 2);
        assert_eq!(buffers[1], body);
    }

    #[test]
    fn empty_body_is_omitted() {
        let head: ResponseHead = Response::builder().status(StatusCode::NO_CONTENT).body(()).unwrap();
        let buffers = to_buffers(&head, Bytes::new()).unwrap();
        assert_eq!(buffers.len(), 1);
    }
}
