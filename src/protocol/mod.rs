mod request;
pub use request::RequestHeader;

mod error;
pub use error::HandlerError;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;

use http::Response;

/// The header portion of an HTTP response: `http::Response<()>` with an
/// empty body placeholder. Body bytes travel separately through the
/// connection's reply stream.
pub type ResponseHead = Response<()>;
