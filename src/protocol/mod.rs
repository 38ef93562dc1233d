mod message;
pub use message::HttpContent;
pub use message::Message;
pub use message::PayloadSize;

mod request;
pub use request::HttpRequestPacket;
pub use request::ProcessingState;

mod response;
pub use response::HttpResponsePacket;

mod error;
pub use error::EncodingError;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;
