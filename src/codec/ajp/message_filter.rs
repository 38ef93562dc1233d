//! AJP packet framing.
//!
//! Splits the wire stream into complete packets (`magic(2) | length(2 BE) |
//! payload`) and hands each payload to the filter above. Unknown magic or an
//! oversized length is fatal to the connection.

use crate::attributes::{default_attribute_builder, Attribute};
use crate::codec::ajp::constants::{CONTAINER_MAGIC, H_SIZE, MAX_PACKET_SIZE, SERVER_MAGIC};
use crate::filter::{ChainMessage, Filter, FilterChainContext, NextAction, PipelineError};
use crate::memory::Buffer;
use crate::protocol::ParseError;
use async_trait::async_trait;
use bytes::Buf;
use tracing::trace;

pub struct AjpMessageFilter {
    parsing_state: Attribute<ParsingState>,
}

#[derive(Default)]
struct ParsingState {
    header_parsed: bool,
    length: usize,
}

impl ParsingState {
    fn parsed(&mut self) {
        self.header_parsed = false;
        self.length = 0;
    }
}

impl AjpMessageFilter {
    pub fn new() -> Self {
        Self {
            parsing_state: default_attribute_builder()
                .attribute_with("ajp-message-filter.parsing-state", ParsingState::default),
        }
    }
}

impl Default for AjpMessageFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Filter for AjpMessageFilter {
    fn name(&self) -> &'static str {
        "ajp-message"
    }

    async fn handle_read(&self, ctx: &mut FilterChainContext<'_>) -> Result<NextAction, PipelineError> {
        let Some(message) = ctx.take_message() else {
            return Ok(NextAction::invoke());
        };
        let Some(buffer) = message.into_buffer() else {
            return Err(PipelineError::internal("ajp framing expects wire buffers"));
        };

        let mut src = buffer.into_bytes_mut();
        let state = self.parsing_state.get_or_insert(ctx.attributes());

        // have we read the packet header?
        if !state.header_parsed {
            if src.len() < H_SIZE {
                return Ok(NextAction::stop_with(Buffer::from(src)));
            }

            let mark = u16::from_be_bytes([src[0], src[1]]);
            if mark != SERVER_MAGIC && mark != CONTAINER_MAGIC {
                return Err(ParseError::invalid_frame(format!("unexpected mark={mark:#06x}")).into());
            }

            state.length = u16::from_be_bytes([src[2], src[3]]) as usize;
            state.header_parsed = true;

            if state.length + H_SIZE > MAX_PACKET_SIZE {
                return Err(ParseError::invalid_frame(format!(
                    "the message is too large: {} > {MAX_PACKET_SIZE}",
                    state.length + H_SIZE
                ))
                .into());
            }
        }

        // do we have the entire payload?
        if src.len() < H_SIZE + state.length {
            return Ok(NextAction::stop_with(Buffer::from(src)));
        }

        src.advance(H_SIZE);
        let payload = src.split_to(state.length).freeze();
        state.parsed();

        trace!(len = payload.len(), "framed ajp packet");
        ctx.set_message(ChainMessage::Buffer(Buffer::from(payload)));

        if src.is_empty() {
            Ok(NextAction::invoke())
        } else {
            Ok(NextAction::invoke_with(Buffer::from(src)))
        }
    }
}
