//! Message boundaries on top of the transport.

use bytes::{BufMut, BytesMut};

use crate::buffer::{FragmentBuffer, Readable};
use crate::{Error, Result};

use super::{Handler, Item, SessionContext};

/// Largest frame accepted on a stream.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default)]
/// Every datagram is exactly one frame.
pub struct DatagramFramer;

impl Handler for DatagramFramer {
    fn on_read(&self, _ctx: &mut SessionContext, item: Item) -> Result<Item> {
        match item {
            Item::Inbound(mut datagram) => {
                let frame = FragmentBuffer::new();
                let readable = datagram.readable_bytes();
                frame.transfer_from(&mut datagram, readable);
                Ok(Item::Frame(frame))
            }
            other => Ok(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
/// `u32` big-endian length prefix in front of every frame.
pub struct LengthFieldFramer {
    max_frame_size: usize,
}

impl LengthFieldFramer {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for LengthFieldFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Handler for LengthFieldFramer {
    fn on_read(&self, ctx: &mut SessionContext, item: Item) -> Result<Item> {
        let mut cumulation = match item {
            Item::Inbound(cumulation) => cumulation,
            other => return Ok(other),
        };

        let Some(length) = cumulation.peek_u32() else {
            ctx.leftover = Some(cumulation);
            return Ok(Item::Pending);
        };
        let length = length as usize;

        if length > self.max_frame_size {
            // The prefix still tells where the next frame starts.
            cumulation.discard(4 + length);
            ctx.leftover = Some(cumulation);
            return Err(Error::InvalidFrame("frame exceeds maximum size"));
        }

        if cumulation.readable_bytes() < 4 + length {
            ctx.leftover = Some(cumulation);
            return Ok(Item::Pending);
        }

        cumulation.skip(4);
        let frame = FragmentBuffer::new();
        frame.transfer_from(&mut cumulation, length);
        ctx.leftover = Some(cumulation);

        Ok(Item::Frame(frame))
    }

    fn on_write(&self, _ctx: &mut SessionContext, item: Item) -> Result<Item> {
        match item {
            Item::Frame(body) => {
                if body.len() > self.max_frame_size {
                    return Err(Error::InvalidFrame("frame exceeds maximum size"));
                }
                let length = u32::try_from(body.len())
                    .map_err(|_| Error::InvalidFrame("frame exceeds maximum size"))?;

                let mut prefix = BytesMut::with_capacity(4);
                prefix.put_u32(length);

                let framed = FragmentBuffer::with_capacity(1 + body.segments().len());
                framed.push(prefix.freeze());
                framed.add(&body);

                Ok(Item::Frame(framed))
            }
            other => Ok(other),
        }
    }
}
