//! AJP/1.3 codec.
//!
//! Two filters implement the protocol: [`AjpMessageFilter`] frames the wire
//! stream into packets, [`AjpHandlerFilter`] decodes and encodes the
//! messages inside them, presenting decoded requests as the same packet
//! objects the HTTP codec produces. The server filter above is
//! protocol-agnostic.

pub mod constants;

mod handler_filter;
mod message_filter;

pub use handler_filter::AjpHandlerFilter;
pub use message_filter::AjpMessageFilter;
