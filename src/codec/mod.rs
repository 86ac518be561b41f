//! Encoding and decoding of HTTP/1.1 messages.
//!
//! The request side is a restartable incremental parser
//! ([`RequestParser`]): it is fed byte slices as they arrive and reports
//! either that it needs more data, or a complete request head together with
//! the number of bytes it consumed from the last slice. The response side
//! serializes a response head into a single contiguous byte range
//! ([`encode_head`]) and provides the canned replies the connection sends
//! on its own behalf ([`stock`]).

mod request_parser;
pub use request_parser::ParseStatus;
pub use request_parser::RequestParser;

mod response_encoder;
pub use response_encoder::encode_head;
pub use response_encoder::to_buffers;

pub mod stock;
