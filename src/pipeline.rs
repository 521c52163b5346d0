//! Per-message handler chains.
//!
//! A [Pipeline] is an ordered, immutable list of [Handler] stages shared by
//! every message of a channel. Each message gets its own [PipelineSession]:
//! inbound items run through the stages front to back, outbound items back to
//! front.

mod codec;
mod framing;

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::buffer::{FragmentBuffer, ReadBuffer};
use crate::common::Message;
use crate::dispatch::Dispatcher;
use crate::{Error, Result};

pub use codec::MessageCodec;
pub use framing::{DatagramFramer, LengthFieldFramer, DEFAULT_MAX_FRAME_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The transport association a message travels on.
pub struct ConnectionInfo {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub is_udp: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Lifecycle notifications fired through [Pipeline::fire_event].
pub enum ChannelEvent {
    Active,
    Inactive,
    /// Neither read nor write happened for the whole idle window.
    AllIdle,
}

#[derive(Debug)]
/// What flows between stages.
pub enum Item {
    /// Raw bytes accumulated from the socket, not yet framed.
    Inbound(ReadBuffer),
    /// One complete frame.
    Frame(FragmentBuffer),
    /// A decoded message, or an outbound message to encode.
    Message(Message),
    /// An answer to write back on the same association.
    Reply(Message),
    /// Consumed, nothing to send back.
    Handled,
    /// The decoder needs more bytes.
    Pending,
}

/// One stage of a [Pipeline].
///
/// Stages are shared across sessions and threads, so they keep no per-message
/// state; anything left over goes into the [SessionContext].
pub trait Handler: Debug + Send + Sync {
    /// Transforms an inbound item. Items a stage does not understand are
    /// returned unchanged.
    fn on_read(&self, _ctx: &mut SessionContext, item: Item) -> Result<Item> {
        Ok(item)
    }

    /// Transforms an outbound item.
    fn on_write(&self, _ctx: &mut SessionContext, item: Item) -> Result<Item> {
        Ok(item)
    }

    fn on_event(&self, _info: &ConnectionInfo, _event: ChannelEvent) -> Result<()> {
        Ok(())
    }

    fn on_error(&self, _info: &ConnectionInfo, _error: &Error) {}
}

#[derive(Debug)]
/// Scratch state of one session.
pub struct SessionContext {
    pub info: ConnectionInfo,
    /// Bytes a decoder did not consume, handed back to the channel.
    pub leftover: Option<ReadBuffer>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub created: u64,
    pub released: u64,
}

impl SessionStats {
    pub fn active(&self) -> u64 {
        self.created - self.released
    }
}

#[derive(Clone)]
pub struct Pipeline {
    handlers: Arc<[Arc<dyn Handler>]>,
    stats: Arc<Mutex<SessionStats>>,
}

impl Pipeline {
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Self {
        Self {
            handlers: handlers.into(),
            stats: Default::default(),
        }
    }

    /// `DatagramFramer -> MessageCodec -> dispatcher`.
    pub fn datagram(dispatcher: Dispatcher) -> Self {
        Self::new(vec![
            Arc::new(DatagramFramer),
            Arc::new(MessageCodec),
            Arc::new(dispatcher),
        ])
    }

    /// `LengthFieldFramer -> MessageCodec -> dispatcher`.
    pub fn stream(dispatcher: Dispatcher) -> Self {
        Self::new(vec![
            Arc::new(LengthFieldFramer::default()),
            Arc::new(MessageCodec),
            Arc::new(dispatcher),
        ])
    }

    /// Returns a copy of this pipeline with `handler` appended, and its own
    /// session bookkeeping.
    pub fn with_handler(&self, handler: Arc<dyn Handler>) -> Self {
        let mut handlers = self.handlers.to_vec();
        handlers.push(handler);
        Self::new(handlers)
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn stats(&self) -> SessionStats {
        *self.stats.lock()
    }

    // === Public Methods ===

    /// Creates the execution context for one message.
    pub fn create_session(&self, info: ConnectionInfo) -> PipelineSession {
        self.stats.lock().created += 1;

        PipelineSession {
            pipeline: self.clone(),
            ctx: SessionContext {
                info,
                leftover: None,
            },
            released: false,
        }
    }

    /// Delivers `event` to every stage. A failing stage does not stop the
    /// others, its error is fired as [Handler::on_error].
    pub fn fire_event(&self, info: &ConnectionInfo, event: ChannelEvent) {
        trace!(context = "pipeline_event", ?event, remote = ?info.remote);

        for handler in self.handlers.iter() {
            if let Err(error) = handler.on_event(info, event) {
                warn!(?event, ?error, ?handler, "Event handler failed");
                self.fire_error(info, &error);
            }
        }
    }

    pub fn fire_error(&self, info: &ConnectionInfo, error: &Error) {
        for handler in self.handlers.iter() {
            handler.on_error(info, error);
        }
    }

    fn release(&self) {
        self.stats.lock().released += 1;
    }
}

impl Debug for Pipeline {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("handlers", &self.handlers)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Single-use execution context of one message.
///
/// Released exactly once, either by [PipelineSession::release] or on drop.
#[derive(Debug)]
pub struct PipelineSession {
    pipeline: Pipeline,
    ctx: SessionContext,
    released: bool,
}

impl PipelineSession {
    pub fn info(&self) -> &ConnectionInfo {
        &self.ctx.info
    }

    /// Runs `item` through the stages front to back.
    pub fn read(&mut self, item: Item) -> Result<Item> {
        let mut item = item;

        for handler in self.pipeline.handlers.iter() {
            item = match handler.on_read(&mut self.ctx, item) {
                Ok(item) => item,
                Err(error) => {
                    self.pipeline.fire_error(&self.ctx.info, &error);
                    return Err(error);
                }
            };

            if matches!(item, Item::Pending | Item::Handled) {
                break;
            }
        }

        Ok(item)
    }

    /// Runs `item` through the stages back to front.
    pub fn write(&mut self, item: Item) -> Result<Item> {
        let mut item = item;

        for handler in self.pipeline.handlers.iter().rev() {
            item = match handler.on_write(&mut self.ctx, item) {
                Ok(item) => item,
                Err(error) => {
                    self.pipeline.fire_error(&self.ctx.info, &error);
                    return Err(error);
                }
            };
        }

        Ok(item)
    }

    /// Bytes the decoder left for the next session.
    ///
    /// `None` means no framing stage took ownership of the input, which after
    /// a failed read means the byte stream can not be resynchronized.
    pub fn take_leftover(&mut self) -> Option<ReadBuffer> {
        self.ctx.leftover.take()
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.pipeline.release();
        }
    }
}

impl Drop for PipelineSession {
    fn drop(&mut self) {
        self.release_once();
    }
}

/// Extracts the frame produced by an outbound [PipelineSession::write].
pub(crate) fn into_frame(item: Item) -> Result<FragmentBuffer> {
    match item {
        Item::Frame(frame) => Ok(frame),
        _ => Err(Error::Handler(
            "outbound pipeline did not produce a frame".to_string(),
        )),
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;

    use super::*;

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            local: SocketAddr::from(([127, 0, 0, 1], 1)),
            remote: SocketAddr::from(([127, 0, 0, 1], 2)),
            is_udp: true,
        }
    }

    #[derive(Debug, Default)]
    struct Tag {
        name: &'static str,
        trail: Arc<Mutex<Vec<String>>>,
    }

    impl Handler for Tag {
        fn on_read(&self, _ctx: &mut SessionContext, item: Item) -> Result<Item> {
            self.trail.lock().push(format!("read:{}", self.name));
            Ok(item)
        }

        fn on_write(&self, _ctx: &mut SessionContext, item: Item) -> Result<Item> {
            self.trail.lock().push(format!("write:{}", self.name));
            Ok(item)
        }
    }

    #[derive(Debug, Default)]
    struct Failing {
        errors: AtomicUsize,
    }

    impl Handler for Failing {
        fn on_read(&self, _ctx: &mut SessionContext, _item: Item) -> Result<Item> {
            Err(Error::Handler("boom".to_string()))
        }

        fn on_event(&self, _info: &ConnectionInfo, _event: ChannelEvent) -> Result<()> {
            Err(Error::Handler("event boom".to_string()))
        }

        fn on_error(&self, _info: &ConnectionInfo, _error: &Error) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn stage_order() {
        let trail = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            Arc::new(Tag {
                name: "a",
                trail: trail.clone(),
            }),
            Arc::new(Tag {
                name: "b",
                trail: trail.clone(),
            }),
        ]);

        let mut session = pipeline.create_session(info());
        session.read(Item::Handled).unwrap();
        session.read(Item::Inbound(ReadBuffer::new())).unwrap();
        session.write(Item::Inbound(ReadBuffer::new())).unwrap();
        session.release();

        assert_eq!(
            *trail.lock(),
            vec!["read:a", "read:a", "read:b", "write:b", "write:a"]
        );
    }

    #[test]
    fn session_released_on_every_path() {
        let failing = Arc::new(Failing::default());
        let pipeline = Pipeline::new(vec![failing.clone()]);

        {
            let mut session = pipeline.create_session(info());
            assert!(session.read(Item::Handled).is_err());
            // dropped without explicit release
        }
        pipeline.create_session(info()).release();

        let stats = pipeline.stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.released, 2);
        assert_eq!(stats.active(), 0);
        assert_eq!(failing.errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn event_failures_become_error_events() {
        let failing = Arc::new(Failing::default());
        let pipeline = Pipeline::new(vec![failing.clone(), Arc::new(Tag::default())]);

        pipeline.fire_event(&info(), ChannelEvent::AllIdle);

        assert_eq!(failing.errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn into_frame_requires_frame() {
        assert!(into_frame(Item::Frame(FragmentBuffer::from(Bytes::from_static(b"x")))).is_ok());
        assert!(into_frame(Item::Handled).is_err());
    }
}
