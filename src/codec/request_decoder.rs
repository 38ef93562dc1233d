//! Streaming decoder for inbound requests.
//!
//! The decoder operates in two phases driven by a small state machine:
//! 1. Head parsing with [`HeaderDecoder`]
//! 2. Payload parsing with [`PayloadDecoder`], chosen from the head
//!
//! The `payload_decoder` field is the state: `None` while parsing the head,
//! `Some(_)` while streaming the body. The terminal content piece clears it,
//! so a pipelined follow-up request parses cleanly.

use crate::codec::body::PayloadDecoder;
use crate::codec::header::HeaderDecoder;
use crate::config::ServerConfig;
use crate::protocol::{HttpRequestPacket, Message, ParseError, PayloadSize};
use bytes::BytesMut;
use tokio_util::codec::Decoder;

pub struct RequestDecoder {
    header_decoder: HeaderDecoder,
    payload_decoder: Option<PayloadDecoder>,
}

impl RequestDecoder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_config(config: &ServerConfig) -> Self {
        Self { header_decoder: HeaderDecoder::with_config(config), payload_decoder: None }
    }

    /// Whether the decoder is between messages (no partial body pending).
    pub fn is_idle(&self) -> bool {
        self.payload_decoder.is_none()
    }
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self { header_decoder: HeaderDecoder::new(), payload_decoder: None }
    }
}

impl Decoder for RequestDecoder {
    type Item = Message<(HttpRequestPacket, PayloadSize)>;
    type Error = ParseError;

    /// Attempts to decode one message item from the buffer.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(Message::Header(_)))`: a parsed request head
    /// - `Ok(Some(Message::Content(_)))`: a piece of the request payload
    /// - `Ok(None)`: need more data to proceed
    /// - `Err(_)`: a fatal parse failure
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // parse payload if a payload decoder is installed
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let message = match payload_decoder.decode(src)? {
                Some(content) => {
                    if content.is_last() {
                        // this request is fully parsed now
                        self.payload_decoder.take();
                    }
                    Some(Message::Content(content))
                }
                None => None,
            };

            return Ok(message);
        }

        // parse the request head; empty payloads need no body phase
        let message = match self.header_decoder.decode(src)? {
            Some((header, payload_size)) => {
                if !payload_size.is_empty() {
                    self.payload_decoder = Some(payload_size.into());
                }
                Some(Message::Header((header, payload_size)))
            }
            None => None,
        };

        Ok(message)
    }
}
