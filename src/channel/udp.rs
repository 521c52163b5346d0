//! Datagram channel, every datagram is decoded and answered on its own.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::buffer::{FragmentBuffer, ReadBuffer};
use crate::common::Message;
use crate::config::Config;
use crate::pipeline::{ConnectionInfo, Item, Pipeline};
use crate::{Error, Result};

use super::{ChannelCore, IdleMonitor};

/// A bound UDP endpoint running `pipeline` for every datagram.
///
/// Cloning is cheap, clones share the socket. The receive loop runs until
/// [DatagramChannel::close] or until the last clone is dropped.
#[derive(Debug, Clone)]
pub struct DatagramChannel {
    core: Arc<ChannelCore>,
    socket: Arc<UdpSocket>,
}

impl DatagramChannel {
    /// Binds to `local` and starts the receive loop.
    pub async fn bind(local: SocketAddr, pipeline: Pipeline, config: &Config) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        let local_addr = socket.local_addr()?;

        let core = Arc::new(ChannelCore::new(
            local_addr,
            pipeline,
            config.clone(),
            IdleMonitor::new(config.idle_timeout),
        ));
        let channel = Self {
            core,
            socket: Arc::new(socket),
        };

        channel.core.activate(channel.info(unspecified()));
        tokio::spawn(receive_loop(
            Arc::downgrade(&channel.core),
            channel.core.cancel.clone(),
            channel.socket.clone(),
            config.max_datagram_size,
        ));

        debug!(?local_addr, "Datagram channel bound");

        Ok(channel)
    }

    // === Getters ===

    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.core.pipeline
    }

    pub fn idle_monitor(&self) -> &IdleMonitor {
        &self.core.idle
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Number of requests waiting for a response.
    pub fn inflight_requests(&self) -> usize {
        self.core.inflight.lock().len()
    }

    // === Public Methods ===

    /// Encodes `message` through the pipeline and sends it to
    /// [Message::destination].
    pub async fn send(&self, message: Message) -> Result<()> {
        self.core.ensure_open()?;

        let to = message.destination();
        let message = message.with_udp(true);
        trace!(context = "socket_message_sending", ?message, ?to);

        let frame = self.core.encode(message, self.info(to))?;
        send_frame(&self.core, &self.socket, &frame, to).await
    }

    /// Sends `message` with a fresh correlation id and waits for the matching
    /// response from the same address.
    ///
    /// Fails with [Error::Timeout] after [Config::request_timeout].
    pub async fn request(&self, message: Message) -> Result<Message> {
        self.core.ensure_open()?;

        let mut message = message;
        let to = message.destination();
        let receiver = self.core.begin_request(&mut message, to);
        let message_id = message.message_id;

        if let Err(error) = self.send(message).await {
            self.core.inflight.lock().cancel(message_id);
            return Err(error);
        }

        self.core.await_response(message_id, receiver).await
    }

    /// Stops the receive loop and the idle monitor. Idempotent.
    pub fn close(&self) {
        self.core.shutdown(self.info(unspecified()));
    }

    // === Private Methods ===

    fn info(&self, remote: SocketAddr) -> ConnectionInfo {
        ConnectionInfo {
            local: self.core.local_addr,
            remote,
            is_udp: true,
        }
    }
}

fn unspecified() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

async fn send_frame(
    core: &ChannelCore,
    socket: &UdpSocket,
    frame: &FragmentBuffer,
    to: SocketAddr,
) -> Result<()> {
    if frame.len() > core.config.max_datagram_size {
        return Err(Error::InvalidFrame("datagram exceeds maximum size"));
    }

    socket.send_to(&frame.to_bytes(), to).await?;
    core.idle.on_write_complete();

    Ok(())
}

async fn receive_loop(
    core: Weak<ChannelCore>,
    cancel: CancellationToken,
    socket: Arc<UdpSocket>,
    max_datagram_size: usize,
) {
    // One spare byte tells a full datagram from a cut one.
    let capacity = max_datagram_size + 1;
    let mut buf = BytesMut::with_capacity(capacity);

    loop {
        buf.clear();
        buf.reserve(capacity);

        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = socket.recv_buf_from(&mut buf) => received,
        };

        let Some(core) = core.upgrade() else {
            break;
        };

        let (len, from) = match received {
            Ok(received) => received,
            Err(error) => {
                if core.is_closed() {
                    break;
                }
                debug!(?error, "Error receiving datagram");
                continue;
            }
        };

        if from.port() == 0 {
            trace!(context = "socket_validation", message = "Datagram from port 0");
            continue;
        }

        if len > max_datagram_size {
            trace!(
                context = "socket_validation",
                ?from,
                max_datagram_size,
                message = "Oversized datagram"
            );
            continue;
        }

        let datagram = ReadBuffer::from(buf.split().freeze());
        let info = ConnectionInfo {
            local: core.local_addr,
            remote: from,
            is_udp: true,
        };

        let mut session = core.pipeline.create_session(info);
        let reply = core.receive(&mut session, Item::Inbound(datagram), from);
        session.release();

        match reply {
            Ok(Some(frame)) => {
                if let Err(error) = send_frame(&core, &socket, &frame, from).await {
                    debug!(?error, ?from, "Error sending reply");
                }
            }
            Ok(None) => {}
            Err(error) => {
                trace!(context = "socket_error", ?error, ?from, "Dropped invalid datagram");
            }
        }
    }

    trace!(context = "socket_closed", local = ?socket.local_addr().ok(), "Receive loop ended");
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::channel::IdleState;
    use crate::common::{Id, MessageType, PeerAddress};
    use crate::dispatch::Dispatcher;

    use super::*;

    fn localhost() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    async fn channel(config: &Config) -> DatagramChannel {
        let local = PeerAddress::new(Id::random(), localhost());
        let pipeline = Pipeline::datagram(Dispatcher::new(local, config.version));
        DatagramChannel::bind(localhost(), pipeline, config).await.unwrap()
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let channel = channel(&Config::default()).await;

        channel.close();
        channel.close();

        assert!(channel.is_closed());
        assert_eq!(channel.idle_monitor().state(), IdleState::Destroyed);

        let peer = PeerAddress::new(Id::random(), channel.local_addr());
        let message = Message::request(peer, peer, 0, MessageType::Request1, 1);
        assert!(matches!(channel.send(message).await, Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn request_times_out_without_response() {
        let config = Config {
            request_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let channel = channel(&config).await;

        // nobody answers on a socket that never reads
        let silent = UdpSocket::bind(localhost()).await.unwrap();
        let to = PeerAddress::new(Id::random(), silent.local_addr().unwrap());
        let from = PeerAddress::new(Id::random(), channel.local_addr());

        let result = channel
            .request(Message::request(from, to, 0, MessageType::Request1, 1))
            .await;

        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(channel.inflight_requests(), 0);
    }

    #[tokio::test]
    async fn dropping_every_handle_releases_the_socket() {
        let channel = channel(&Config::default()).await;
        let local = channel.local_addr();
        assert_eq!(channel.idle_monitor().state(), IdleState::Active);

        let clone = channel.clone();
        drop(channel);
        drop(clone);

        let rebound = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match UdpSocket::bind(local).await {
                    Ok(socket) => break socket,
                    Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(rebound.local_addr().unwrap(), local);
    }

    #[tokio::test]
    async fn oversized_datagram_is_refused() {
        let config = Config {
            max_datagram_size: 64,
            ..Default::default()
        };
        let channel = channel(&config).await;
        let peer = PeerAddress::new(Id::random(), channel.local_addr());

        let message = Message::request(peer, peer, 0, MessageType::Request1, 1)
            .with_payload(FragmentBuffer::from(vec![0u8; 128]));

        assert!(matches!(
            channel.send(message).await,
            Err(Error::InvalidFrame(_))
        ));
    }
}
