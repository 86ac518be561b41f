use std::mem::MaybeUninit;

use bytes::BytesMut;
use http::{HeaderName, HeaderValue, Request, Version};
use httparse::{Error, Status};
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, RequestHeader};

pub(crate) const MAX_HEADER_NUM: usize = 64;
pub(crate) const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Outcome of feeding bytes to the parser.
pub enum ParseStatus {
    /// More bytes are required before the request head is complete
    Incomplete,
    /// The request head is complete; body bytes may follow in the input
    Complete(RequestHeader),
}

/// A restartable, incremental HTTP/1.1 request-head parser.
///
/// The parser is fed slices of whatever the transport delivered. Bytes that
/// belong to a still-incomplete head are carried over internally, so callers
/// never have to keep partial heads in their own buffers. `advance` reports
/// how many bytes of the given slice it consumed: on completion the
/// remainder of the slice is body (or pipelined next-request) data and stays
/// with the caller.
pub struct RequestParser {
    carried: BytesMut,
}

impl RequestParser {
    pub fn new() -> Self {
        Default::default()
    }

    /// Forget any carried partial head, ready for the next request.
    pub fn reset(&mut self) {
        self.carried.clear();
    }

    /// Feed the next slice of input.
    ///
    /// Returns the parse status and the number of bytes consumed from
    /// `src`. While the head is incomplete every byte is consumed (and
    /// carried); once complete, only the bytes up to the end of the head
    /// are.
    pub fn advance(&mut self, src: &[u8]) -> Result<(ParseStatus, usize), ParseError> {
        if self.carried.is_empty() {
            return match try_parse(src)? {
                Some((header, head_end)) => Ok((ParseStatus::Complete(header), head_end)),
                None => {
                    ensure!(src.len() <= MAX_HEADER_BYTES, ParseError::too_large_header(src.len(), MAX_HEADER_BYTES));
                    self.carried.extend_from_slice(src);
                    Ok((ParseStatus::Incomplete, src.len()))
                }
            };
        }

        let already_carried = self.carried.len();
        self.carried.extend_from_slice(src);
        match try_parse(&self.carried)? {
            Some((header, head_end)) => {
                // bytes before `already_carried` were consumed by earlier calls
                let consumed = head_end - already_carried;
                self.carried.clear();
                Ok((ParseStatus::Complete(header), consumed))
            }
            None => {
                ensure!(
                    self.carried.len() <= MAX_HEADER_BYTES,
                    ParseError::too_large_header(self.carried.len(), MAX_HEADER_BYTES)
                );
                Ok((ParseStatus::Incomplete, src.len()))
            }
        }
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self { carried: BytesMut::new() }
    }
}

fn try_parse(src: &[u8]) -> Result<Option<(RequestHeader, usize)>, ParseError> {
    let mut req = httparse::Request::new(&mut []);
    let mut headers: [MaybeUninit<httparse::Header>; MAX_HEADER_NUM] = unsafe { MaybeUninit::uninit().assume_init() };

    let parsed_result = req.parse_with_uninit_headers(src, &mut headers).map_err(|e| match e {
        Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
        e => ParseError::invalid_header(e.to_string()),
    });

    match parsed_result? {
        Status::Complete(head_end) => {
            trace!(head_size = head_end, "parsed request head");
            ensure!(head_end <= MAX_HEADER_BYTES, ParseError::too_large_header(head_end, MAX_HEADER_BYTES));

            let version = match req.version {
                Some(0) => Version::HTTP_10,
                Some(1) => Version::HTTP_11,
                // http2/3 negotiate elsewhere; anything else is noise
                _ => return Err(ParseError::InvalidVersion(req.version)),
            };

            let mut builder = Request::builder()
                .method(req.method.ok_or(ParseError::InvalidMethod)?)
                .uri(req.path.ok_or(ParseError::InvalidUri)?)
                .version(version);

            let header_count = req.headers.len();
            // httparse has already vetted method and path, so the builder holds no error
            let headers = builder.headers_mut().unwrap();
            headers.reserve(header_count);

            for header in req.headers.iter() {
                let name =
                    HeaderName::from_bytes(header.name.as_bytes()).map_err(|e| ParseError::invalid_header(e.to_string()))?;
                let value =
                    HeaderValue::from_bytes(header.value).map_err(|e| ParseError::invalid_header(e.to_string()))?;
                headers.append(name, value);
            }

            let header = RequestHeader::from(builder.body(()).unwrap());
            Ok(Some((header, head_end)))
        }
        Status::Partial => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use indoc::indoc;

    fn crlf(text: &str) -> String {
        text.replace('\n', "\r\n")
    }

    #[test]
    fn complete_in_one_slice() {
        let text = crlf(indoc! {r##"
        GET /index.html HTTP/1.1
        Host: 127.0.0.1:8080
        Accept: */*

        "##});

        let mut parser = RequestParser::new();
        let (status, consumed) = parser.advance(text.as_bytes()).unwrap();

        assert_eq!(consumed, text.len());
        let header = match status {
            ParseStatus::Complete(header) => header,
            ParseStatus::Incomplete => panic!("expected a complete head"),
        };
        assert_eq!(header.method(), &Method::GET);
        assert_eq!(header.uri().path(), "/index.html");
        assert_eq!(header.version(), Version::HTTP_11);
        assert_eq!(header.headers().len(), 2);
    }

    #[test]
    fn head_split_across_slices() {
        let text = crlf(indoc! {r##"
        POST /p HTTP/1.1
        Host: h
        Content-Length: 10

        "##});
        let (first, second) = text.split_at(20);

        let mut parser = RequestParser::new();
        let (status, consumed) = parser.advance(first.as_bytes()).unwrap();
        assert!(matches!(status, ParseStatus::Incomplete));
        assert_eq!(consumed, first.len());

        let (status, consumed) = parser.advance(second.as_bytes()).unwrap();
        assert_eq!(consumed, second.len());
        match status {
            ParseStatus::Complete(header) => {
                assert_eq!(header.method(), &Method::POST);
                assert_eq!(header.content_length().unwrap(), Some(10));
            }
            ParseStatus::Incomplete => panic!("expected a complete head"),
        }
    }

    #[test]
    fn body_bytes_stay_with_the_caller() {
        let text = crlf(indoc! {r##"
        POST /p HTTP/1.1
        Content-Length: 5

        HELLO"##});

        let mut parser = RequestParser::new();
        let (status, consumed) = parser.advance(text.as_bytes()).unwrap();

        assert!(matches!(status, ParseStatus::Complete(_)));
        assert_eq!(&text.as_bytes()[consumed..], b"HELLO");
    }

    #[test]
    fn carried_head_does_not_steal_body_bytes() {
        let head = crlf("POST /p HTTP/1.1\nContent-Length: 5\n\n");
        let (first, second) = head.split_at(10);
        let second_with_body = format!("{second}HELLO");

        let mut parser = RequestParser::new();
        let (_, consumed) = parser.advance(first.as_bytes()).unwrap();
        assert_eq!(consumed, first.len());

        let (status, consumed) = parser.advance(second_with_body.as_bytes()).unwrap();
        assert!(matches!(status, ParseStatus::Complete(_)));
        assert_eq!(&second_with_body.as_bytes()[consumed..], b"HELLO");
    }

    #[test]
    fn malformed_start_line_is_rejected() {
        let mut parser = RequestParser::new();
        assert!(parser.advance(b"NOT-HTTP\r\n\r\n").is_err());
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut parser = RequestParser::new();
        assert!(parser.advance(b"GET / HTTP/4.2\r\n\r\n").is_err());
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut parser = RequestParser::new();
        let mut text = String::from("GET / HTTP/1.1\r\n");
        while text.len() <= MAX_HEADER_BYTES {
            text.push_str("X-Filler: yes\r\n");
        }
        assert!(matches!(parser.advance(text.as_bytes()), Err(ParseError::TooLargeHeader { .. })));
    }

    #[test]
    fn reset_restarts_cleanly() {
        let mut parser = RequestParser::new();
        let (status, _) = parser.advance(b"GET /one HTTP/1.1\r\n").unwrap();
        assert!(matches!(status, ParseStatus::Incomplete));

        parser.reset();
        let (status, _) = parser.advance(b"GET /two HTTP/1.1\r\n\r\n").unwrap();
        match status {
            ParseStatus::Complete(header) => assert_eq!(header.uri().path(), "/two"),
            ParseStatus::Incomplete => panic!("expected a complete head"),
        }
    }
}
