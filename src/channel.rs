//! Stream and datagram endpoints driving a [Pipeline].

mod idle;
mod inflight_requests;
#[cfg(feature = "listener")]
mod listener;
mod tcp;
mod udp;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::buffer::FragmentBuffer;
use crate::common::Message;
use crate::config::Config;
use crate::pipeline::{into_frame, ChannelEvent, ConnectionInfo, Item, Pipeline, PipelineSession};
use crate::{Error, Result};

pub use idle::{IdleMonitor, IdleState};
pub use inflight_requests::{InflightRequest, InflightRequests};
#[cfg(feature = "listener")]
pub use listener::StreamListener;
pub use tcp::StreamChannel;
pub use udp::DatagramChannel;

/// State of a channel, owned by its handles.
///
/// Receive loops only hold a weak reference, dropping the last handle shuts
/// the channel down.
#[derive(Debug)]
pub(crate) struct ChannelCore {
    pub(crate) local_addr: SocketAddr,
    pub(crate) pipeline: Pipeline,
    pub(crate) config: Config,
    pub(crate) idle: IdleMonitor,
    pub(crate) inflight: Mutex<InflightRequests>,
    pub(crate) cancel: CancellationToken,
    closed: AtomicBool,
    /// Set once [ChannelCore::activate] announced the association.
    activated: Mutex<Option<ConnectionInfo>>,
}

impl ChannelCore {
    pub(crate) fn new(
        local_addr: SocketAddr,
        pipeline: Pipeline,
        config: Config,
        idle: IdleMonitor,
    ) -> Self {
        Self {
            local_addr,
            pipeline,
            config,
            idle,
            inflight: Mutex::new(InflightRequests::new()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            activated: Mutex::new(None),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        Ok(())
    }

    /// Starts idle tracking and announces the association.
    pub(crate) fn activate(&self, info: ConnectionInfo) {
        *self.activated.lock() = Some(info);
        self.idle.activate(self.pipeline.clone(), info);
        self.pipeline.fire_event(&info, ChannelEvent::Active);
    }

    /// Runs `message` through a fresh outbound session.
    pub(crate) fn encode(&self, message: Message, info: ConnectionInfo) -> Result<FragmentBuffer> {
        let mut session = self.pipeline.create_session(info);
        let frame = into_frame(session.write(Item::Message(message))?);
        session.release();
        frame
    }

    /// Feeds one inbound item to `session`.
    ///
    /// Returns the encoded reply if the pipeline produced one, responses are
    /// handed to the request waiting for them.
    pub(crate) fn receive(
        &self,
        session: &mut PipelineSession,
        item: Item,
        from: SocketAddr,
    ) -> Result<Option<FragmentBuffer>> {
        self.idle.on_read();

        match session.read(item)? {
            Item::Reply(reply) => {
                trace!(context = "channel_reply", ?reply, ?from);
                Ok(Some(into_frame(session.write(Item::Reply(reply))?)?))
            }
            Item::Message(message) => {
                self.deliver(message, &from);
                Ok(None)
            }
            Item::Handled | Item::Pending => Ok(None),
            other => {
                trace!(context = "channel_unconsumed", ?other, ?from);
                Ok(None)
            }
        }
    }

    fn deliver(&self, message: Message, from: &SocketAddr) {
        if message.is_request() {
            trace!(context = "channel_undispatched", ?message, ?from, "No dispatcher in pipeline");
            return;
        }

        let message_id = message.message_id;
        if !self.inflight.lock().resolve(message, from) {
            trace!(
                context = "channel_validation",
                message_id,
                ?from,
                "Unexpected response"
            );
        }
    }

    /// Registers `message` as inflight, overwriting its correlation id.
    pub(crate) fn begin_request(
        &self,
        message: &mut Message,
        to: SocketAddr,
    ) -> flume::Receiver<Message> {
        let mut inflight = self.inflight.lock();
        inflight.cleanup(self.config.request_timeout);

        let (id, receiver) = inflight.add(to);
        message.message_id = id;
        receiver
    }

    pub(crate) async fn await_response(
        &self,
        message_id: u32,
        receiver: flume::Receiver<Message>,
    ) -> Result<Message> {
        match tokio::time::timeout(self.config.request_timeout, receiver.recv_async()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => {
                self.inflight.lock().cancel(message_id);
                Err(Error::Timeout)
            }
        }
    }

    /// Terminal. Returns false if the channel was already closed.
    pub(crate) fn shutdown(&self, info: ConnectionInfo) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.cancel.cancel();
        self.idle.destroy();
        self.inflight.lock().clear();
        self.pipeline.fire_event(&info, ChannelEvent::Inactive);

        debug!(local = ?self.local_addr, remote = ?info.remote, "Channel closed");
        true
    }
}

impl Drop for ChannelCore {
    fn drop(&mut self) {
        let activated = *self.activated.lock();

        match activated {
            Some(info) => {
                if self.shutdown(info) {
                    trace!(context = "channel_dropped", local = ?self.local_addr);
                }
            }
            None => self.cancel.cancel(),
        }
    }
}
