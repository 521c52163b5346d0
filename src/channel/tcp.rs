//! Stream channel, a byte stream cut into frames by the pipeline.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::buffer::{FragmentBuffer, ReadBuffer, Readable};
use crate::common::Message;
use crate::config::Config;
use crate::pipeline::{ConnectionInfo, Item, Pipeline};
use crate::{Error, Result};

use super::{ChannelCore, IdleMonitor};

/// A TCP endpoint bound at construction and associated with one remote peer
/// by [StreamChannel::connect], or accepted by a listener.
///
/// Cloning is cheap, clones share the connection. Dropping the last clone
/// closes it.
#[derive(Debug, Clone)]
pub struct StreamChannel {
    core: Arc<ChannelCore>,
    connection: Arc<Connection>,
}

#[derive(Debug)]
struct Connection {
    /// Bound but not yet connected.
    socket: Mutex<Option<TcpSocket>>,
    remote: Mutex<Option<SocketAddr>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
}

impl StreamChannel {
    /// Binds a stream socket to `local`. Nothing is sent or received until
    /// [StreamChannel::connect].
    pub fn bind(local: SocketAddr, pipeline: Pipeline, config: &Config) -> Result<Self> {
        let socket = match local {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.bind(local)?;
        let local_addr = socket.local_addr()?;

        Ok(Self::new(
            local_addr,
            pipeline,
            config,
            IdleMonitor::new(config.idle_timeout),
            Some(socket),
        ))
    }

    /// Wraps an accepted connection and starts its receive loop.
    pub(crate) async fn from_stream(
        stream: TcpStream,
        pipeline: Pipeline,
        config: &Config,
        idle: IdleMonitor,
    ) -> Result<Self> {
        let channel = Self::new(stream.local_addr()?, pipeline, config, idle, None);
        channel.attach(stream).await?;

        Ok(channel)
    }

    fn new(
        local_addr: SocketAddr,
        pipeline: Pipeline,
        config: &Config,
        idle: IdleMonitor,
        socket: Option<TcpSocket>,
    ) -> Self {
        Self {
            core: Arc::new(ChannelCore::new(local_addr, pipeline, config.clone(), idle)),
            connection: Arc::new(Connection {
                socket: Mutex::new(socket),
                remote: Mutex::new(None),
                writer: tokio::sync::Mutex::new(None),
            }),
        }
    }

    // === Getters ===

    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr
    }

    /// The connected peer, `None` before [StreamChannel::connect].
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.connection.remote.lock()
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

    pub fn inflight_requests(&self) -> usize {
        self.core.inflight.lock().len()
    }

    // === Public Methods ===

    /// Connects to `remote` and starts the receive loop.
    ///
    /// A failed connect closes the channel.
    pub async fn connect(&self, remote: SocketAddr) -> Result<()> {
        self.core.ensure_open()?;

        let socket = self
            .connection
            .socket
            .lock()
            .take()
            .ok_or(Error::AlreadyConnected)?;

        match socket.connect(remote).await {
            Ok(stream) => self.attach(stream).await,
            Err(error) => {
                debug!(?error, ?remote, "Failed to connect");
                self.close();
                Err(error.into())
            }
        }
    }

    /// Encodes `message` through the pipeline and writes it to the peer.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.core.ensure_open()?;
        let remote = self.remote_addr().ok_or(Error::NotConnected)?;

        let message = message.with_udp(false);
        trace!(context = "stream_message_sending", ?message, ?remote);

        let frame = self.core.encode(message, self.info(remote))?;
        self.write_frame(&frame).await
    }

    /// Sends `message` with a fresh correlation id and waits for the matching
    /// response on this connection.
    ///
    /// Fails with [Error::Timeout] after [Config::request_timeout].
    pub async fn request(&self, message: Message) -> Result<Message> {
        self.core.ensure_open()?;
        let remote = self.remote_addr().ok_or(Error::NotConnected)?;

        let mut message = message;
        let receiver = self.core.begin_request(&mut message, remote);
        let message_id = message.message_id;

        if let Err(error) = self.send(message).await {
            self.core.inflight.lock().cancel(message_id);
            return Err(error);
        }

        self.core.await_response(message_id, receiver).await
    }

    /// Stops the receive loop and the idle monitor, the connection is shut
    /// down once the loop exits. Idempotent.
    pub fn close(&self) {
        let remote = self
            .remote_addr()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

        if self.core.shutdown(self.info(remote)) {
            self.connection.socket.lock().take();
        }
    }

    // === Private Methods ===

    fn info(&self, remote: SocketAddr) -> ConnectionInfo {
        ConnectionInfo {
            local: self.core.local_addr,
            remote,
            is_udp: false,
        }
    }

    async fn attach(&self, stream: TcpStream) -> Result<()> {
        let remote = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        *self.connection.writer.lock().await = Some(writer);
        *self.connection.remote.lock() = Some(remote);

        let info = self.info(remote);
        self.core.activate(info);
        tokio::spawn(receive_loop(
            Arc::downgrade(&self.core),
            self.connection.clone(),
            self.core.cancel.clone(),
            reader,
            info,
        ));

        debug!(local = ?self.core.local_addr, ?remote, "Stream channel connected");

        Ok(())
    }

    async fn write_frame(&self, frame: &FragmentBuffer) -> Result<()> {
        let mut writer = self.connection.writer.lock().await;
        // Closed while waiting for the writer.
        self.core.ensure_open()?;
        let writer = writer.as_mut().ok_or(Error::NotConnected)?;

        let result = async {
            for segment in frame.segments() {
                writer.write_all(&segment).await?;
            }
            writer.flush().await
        }
        .await;

        if let Err(error) = result {
            // A partial frame leaves the stream unusable.
            debug!(?error, "Stream write failed");
            self.close();
            return Err(error.into());
        }

        self.core.idle.on_write_complete();
        Ok(())
    }

    /// Runs the cumulation through as many sessions as it has frames.
    ///
    /// Returns false if the connection has to be closed.
    async fn process(&self, cumulation: &mut ReadBuffer, info: ConnectionInfo) -> bool {
        while !cumulation.is_empty() {
            let before = cumulation.readable_bytes();

            let mut session = self.core.pipeline.create_session(info);
            let result = self.core.receive(
                &mut session,
                Item::Inbound(std::mem::take(cumulation)),
                info.remote,
            );
            let leftover = session.take_leftover();
            session.release();

            match result {
                Ok(Some(frame)) => {
                    if self.write_frame(&frame).await.is_err() {
                        return false;
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    if leftover.is_none() {
                        debug!(?error, remote = ?info.remote, "Unrecoverable stream error");
                        return false;
                    }
                    trace!(context = "stream_error", ?error, remote = ?info.remote, "Dropped invalid message");
                }
            }

            let Some(leftover) = leftover else {
                break;
            };
            let progressed = leftover.readable_bytes() < before;
            *cumulation = leftover;

            if !progressed {
                // Incomplete frame, wait for more bytes.
                break;
            }
        }

        true
    }
}

async fn receive_loop(
    core: Weak<ChannelCore>,
    connection: Arc<Connection>,
    cancel: CancellationToken,
    mut reader: OwnedReadHalf,
    info: ConnectionInfo,
) {
    let chunk = match core.upgrade() {
        Some(core) => core.config.stream_read_chunk.max(1),
        None => return,
    };

    let mut cumulation = ReadBuffer::new();
    let mut buf = BytesMut::with_capacity(chunk);

    loop {
        buf.reserve(chunk);
        let mut limited = (&mut buf).limit(chunk);

        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = reader.read_buf(&mut limited) => read,
        };

        match read {
            Ok(0) => {
                trace!(context = "stream_eof", remote = ?info.remote);
                break;
            }
            Ok(_) => {}
            Err(error) => {
                if !cancel.is_cancelled() {
                    debug!(?error, remote = ?info.remote, "Stream read failed");
                }
                break;
            }
        }

        // Coalesce whatever else is already available.
        let mut eof = false;
        loop {
            buf.reserve(chunk);
            let mut limited = (&mut buf).limit(chunk);

            match reader.try_read_buf(&mut limited) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(_) => {}
                Err(error) if error.kind() == ErrorKind::WouldBlock => break,
                Err(error) => {
                    debug!(?error, remote = ?info.remote, "Stream read failed");
                    eof = true;
                    break;
                }
            }
        }

        cumulation.push(buf.split().freeze());

        let Some(core) = core.upgrade() else {
            break;
        };
        let channel = StreamChannel {
            core,
            connection: connection.clone(),
        };

        if !channel.process(&mut cumulation, info).await || eof || channel.is_closed() {
            break;
        }
    }

    if let Some(core) = core.upgrade() {
        StreamChannel {
            core,
            connection: connection.clone(),
        }
        .close();
    }
    connection.writer.lock().await.take();

    trace!(context = "stream_closed", remote = ?info.remote, "Receive loop ended");
}
