use tracing::trace;

use crate::buffer::ReadBuffer;
use crate::common::Message;
use crate::Result;

use super::{Handler, Item, SessionContext};

#[derive(Debug, Clone, Copy, Default)]
/// Frame <-> [Message].
///
/// Inbound messages are stamped with the sockets of the association they
/// arrived on, so responses can be routed back.
pub struct MessageCodec;

impl Handler for MessageCodec {
    fn on_read(&self, ctx: &mut SessionContext, item: Item) -> Result<Item> {
        match item {
            Item::Frame(frame) => {
                let mut readable = ReadBuffer::new();
                frame.transfer_to(&mut readable);

                let mut message = Message::decode(&mut readable)?;
                message.sender_socket = Some(ctx.info.remote);
                message.recipient_socket = Some(ctx.info.local);

                trace!(context = "codec_decoded", ?message);
                Ok(Item::Message(message))
            }
            other => Ok(other),
        }
    }

    fn on_write(&self, _ctx: &mut SessionContext, item: Item) -> Result<Item> {
        match item {
            Item::Message(message) | Item::Reply(message) => {
                trace!(context = "codec_encoding", ?message);
                Ok(Item::Frame(message.encode()?))
            }
            other => Ok(other),
        }
    }
}
