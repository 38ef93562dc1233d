//! Body framing codecs.
//!
//! Encoders and decoders for the two transfer strategies of HTTP/1.x
//! (chunked transfer encoding and Content-Length framing) plus the no-body
//! short circuit. [`PayloadDecoder`] and [`PayloadEncoder`] pick the
//! strategy from the message head and drive the specific state machines.

mod chunked_decoder;
mod chunked_encoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;
mod payload_encoder;

pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::PayloadEncoder;
