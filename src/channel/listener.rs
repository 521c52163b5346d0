use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::Config;
use crate::pipeline::Pipeline;
use crate::{Error, Result};

use super::{IdleMonitor, StreamChannel};

/// Accepts inbound stream connections, each served by its own
/// [StreamChannel] with a fresh [IdleMonitor].
///
/// Channels returned by [StreamListener::accept] outlive the listener.
#[derive(Debug)]
pub struct StreamListener {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accepted: flume::Receiver<StreamChannel>,
}

impl StreamListener {
    pub async fn bind(local: SocketAddr, pipeline: Pipeline, config: &Config) -> Result<Self> {
        let listener = TcpListener::bind(local).await?;
        let local_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let (sender, accepted) = flume::unbounded();

        tokio::spawn(accept_loop(
            listener,
            pipeline,
            config.clone(),
            sender,
            cancel.clone(),
        ));

        debug!(?local_addr, "Stream listener bound");

        Ok(Self {
            local_addr,
            cancel,
            accepted,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the next accepted connection.
    pub async fn accept(&self) -> Result<StreamChannel> {
        self.accepted
            .recv_async()
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Stops accepting. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for StreamListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    pipeline: Pipeline,
    config: Config,
    sender: flume::Sender<StreamChannel>,
    cancel: CancellationToken,
) {
    let template = IdleMonitor::new(config.idle_timeout);

    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, from) = match accepted {
            Ok(accepted) => accepted,
            Err(error) => {
                debug!(?error, "Error accepting stream connection");
                continue;
            }
        };

        trace!(context = "listener_accepted", ?from);

        match StreamChannel::from_stream(stream, pipeline.clone(), &config, template.new_instance())
            .await
        {
            Ok(channel) => {
                // Queued channels serve until accepted. Once the listener is
                // gone the channel is dropped, which closes it.
                if sender.send(channel).is_err() {
                    trace!(context = "listener_closed", ?from, "Dropping unaccepted connection");
                }
            }
            Err(error) => debug!(?error, ?from, "Failed to set up accepted connection"),
        }
    }
}
