//! Liveness probe.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use crate::channel::DatagramChannel;
use crate::common::{Message, MessageType, PeerAddress};
use crate::dispatch::{Dispatcher, RequestHandler, Responder};
use crate::maintenance::Pinger;
use crate::pipeline::ConnectionInfo;
use crate::{Error, Result};

/// Command identifier of ping requests.
pub const PING_COMMAND: u8 = 0;

#[derive(Debug, Clone, Copy, Default)]
/// Answers every ping with an empty [MessageType::Ok].
pub struct PingHandler;

impl RequestHandler for PingHandler {
    fn handle_request(
        &self,
        request: &Message,
        _connection: &ConnectionInfo,
        responder: &mut dyn Responder,
    ) {
        if request.message_type.is_fire_and_forget() {
            responder.respond_fire_and_forget();
            return;
        }

        responder.respond(Message::response(
            request,
            MessageType::Ok,
            request.recipient,
        ));
    }
}

#[derive(Debug, Clone)]
/// Both sides of ping: registers [PingHandler] and probes other peers over a
/// [DatagramChannel].
pub struct PingRpc {
    dispatcher: Dispatcher,
    channel: DatagramChannel,
}

impl PingRpc {
    /// Registers [PingHandler] for [PING_COMMAND] on `dispatcher`.
    pub fn new(dispatcher: Dispatcher, channel: DatagramChannel) -> Self {
        dispatcher.register(Arc::new(PingHandler), &[PING_COMMAND]);

        Self {
            dispatcher,
            channel,
        }
    }

    /// Pings `peer` and waits for its answer.
    ///
    /// Any answer other than [MessageType::Ok] is returned as [Error::Rejected].
    pub async fn ping(&self, peer: PeerAddress) -> Result<Message> {
        let request =
            self.dispatcher
                .create_request_message(peer, PING_COMMAND, MessageType::Request1);

        let response = self.channel.request(request).await?;

        if response.message_type != MessageType::Ok {
            debug!(?peer, message_type = ?response.message_type, "Ping rejected");
            return Err(Error::Rejected(response.message_type));
        }

        Ok(response)
    }

    /// Sends a ping that is never answered.
    pub async fn ping_fire_and_forget(&self, peer: PeerAddress) -> Result<()> {
        let request = self.dispatcher.create_request_message(
            peer,
            PING_COMMAND,
            MessageType::RequestFireForget1,
        );

        self.channel.send(request).await
    }
}

impl Pinger for PingRpc {
    fn probe(&self, peer: PeerAddress) -> BoxFuture<'static, Result<()>> {
        let rpc = self.clone();
        Box::pin(async move { rpc.ping(peer).await.map(|_| ()) })
    }
}
