//! Routing of inbound requests to registered handlers.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::common::{Id, Message, MessageType, PeerAddress};
use crate::error::DispatchError;
use crate::pipeline::{ConnectionInfo, Handler, Item, SessionContext};
use crate::Result;

/// Answers requests for the commands it was registered with.
///
/// Called on the I/O loop of the channel the request arrived on, so it needs
/// to be fast. It must answer through exactly one [Responder] operation.
pub trait RequestHandler: Debug + Send + Sync {
    fn handle_request(
        &self,
        request: &Message,
        connection: &ConnectionInfo,
        responder: &mut dyn Responder,
    );
}

/// The ways a [RequestHandler] can answer.
pub trait Responder {
    /// Send `response` back to the requester.
    fn respond(&mut self, response: Message);

    /// Send an empty response of `message_type` back to the requester.
    fn failed(&mut self, message_type: MessageType);

    /// Acknowledge without replying.
    fn respond_fire_and_forget(&mut self);
}

#[derive(Debug, Default)]
enum Answer {
    #[default]
    Unanswered,
    Response(Message),
    Failed(MessageType),
    FireAndForget,
}

#[derive(Debug, Default)]
struct ReplySlot {
    answer: Answer,
}

impl Responder for ReplySlot {
    fn respond(&mut self, response: Message) {
        self.answer = Answer::Response(response);
    }

    fn failed(&mut self, message_type: MessageType) {
        self.answer = Answer::Failed(message_type);
    }

    fn respond_fire_and_forget(&mut self) {
        self.answer = Answer::FireAndForget;
    }
}

type Registrations = HashMap<Id, HashMap<u8, Arc<dyn RequestHandler>>>;

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    local: PeerAddress,
    version: u32,
    handlers: RwLock<Registrations>,
}

impl Dispatcher {
    /// Creates a dispatcher for the node at `local`, accepting requests of
    /// protocol `version`.
    pub fn new(local: PeerAddress, version: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                local,
                version,
                handlers: RwLock::new(HashMap::new()),
            }),
        }
    }

    // === Getters ===

    pub fn local_peer(&self) -> PeerAddress {
        self.inner.local
    }

    pub fn version(&self) -> u32 {
        self.inner.version
    }

    // === Registration ===

    /// Registers `handler` for `commands` on behalf of the own peer.
    pub fn register(&self, handler: Arc<dyn RequestHandler>, commands: &[u8]) {
        self.register_on_behalf_of(self.inner.local.id, handler, commands)
    }

    /// Registers `handler` for `commands` on behalf of another identity, for
    /// example when relaying for a peer that cannot be reached directly.
    pub fn register_on_behalf_of(
        &self,
        on_behalf_of: Id,
        handler: Arc<dyn RequestHandler>,
        commands: &[u8],
    ) {
        let mut handlers = self.inner.handlers.write();
        let by_command = handlers.entry(on_behalf_of).or_default();
        for command in commands {
            by_command.insert(*command, handler.clone());
        }

        debug!(?on_behalf_of, ?commands, ?handler, "Registered request handler");
    }

    /// Removes every registration made on behalf of `on_behalf_of`.
    pub fn unregister(&self, on_behalf_of: &Id) {
        self.inner.handlers.write().remove(on_behalf_of);
    }

    pub fn lookup(
        &self,
        on_behalf_of: &Id,
        command: u8,
    ) -> Result<Arc<dyn RequestHandler>, DispatchError> {
        self.inner
            .handlers
            .read()
            .get(on_behalf_of)
            .and_then(|by_command| by_command.get(&command))
            .cloned()
            .ok_or(DispatchError::NoHandler {
                on_behalf_of: *on_behalf_of,
                command,
            })
    }

    // === Message skeletons ===

    pub fn create_request_message(
        &self,
        recipient: PeerAddress,
        command: u8,
        message_type: MessageType,
    ) -> Message {
        Message::request(
            self.inner.local,
            recipient,
            command,
            message_type,
            self.inner.version,
        )
    }

    pub fn create_response_message(&self, request: &Message, reply_type: MessageType) -> Message {
        Message::response(request, reply_type, self.inner.local)
    }

    // === Dispatch ===

    /// Routes `request` to its handler and returns what to send back, if
    /// anything.
    ///
    /// Dispatch failures are answered with a failure type instead of being
    /// dropped, except for fire-and-forget requests which are never answered.
    pub fn dispatch(&self, request: &Message, connection: &ConnectionInfo) -> Option<Message> {
        let fire_and_forget = request.message_type.is_fire_and_forget();

        let handler = match self.resolve(request) {
            Ok(handler) => handler,
            Err(error) => {
                debug!(
                    context = "dispatch_miss",
                    %error,
                    from = ?connection.remote,
                    message_id = request.message_id,
                    "Could not dispatch request"
                );

                let reply_type = match error {
                    DispatchError::NoHandler { .. } => MessageType::UnknownId,
                    DispatchError::VersionMismatch { .. } => MessageType::Exception,
                    DispatchError::NotARequest => return None,
                };
                if fire_and_forget {
                    return None;
                }
                return Some(self.create_response_message(request, reply_type));
            }
        };

        let mut slot = ReplySlot::default();
        handler.handle_request(request, connection, &mut slot);

        match slot.answer {
            Answer::Response(response) if !fire_and_forget => {
                trace!(context = "dispatch_response", ?response);
                Some(response)
            }
            Answer::Failed(message_type) if !fire_and_forget => {
                Some(self.create_response_message(request, message_type))
            }
            Answer::Unanswered if !fire_and_forget => {
                warn!(?handler, command = request.command, "Handler did not answer request");
                Some(self.create_response_message(request, MessageType::Exception))
            }
            _ => None,
        }
    }

    fn resolve(&self, request: &Message) -> Result<Arc<dyn RequestHandler>, DispatchError> {
        if !request.is_request() {
            return Err(DispatchError::NotARequest);
        }
        if request.version != self.inner.version {
            return Err(DispatchError::VersionMismatch {
                expected: self.inner.version,
                actual: request.version,
            });
        }

        self.lookup(&request.recipient.id, request.command)
    }
}

impl Debug for Dispatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let handlers = self.inner.handlers.read();
        f.debug_struct("Dispatcher")
            .field("local", &self.inner.local)
            .field("version", &self.inner.version)
            .field("identities", &handlers.len())
            .finish()
    }
}

impl Handler for Dispatcher {
    fn on_read(&self, ctx: &mut SessionContext, item: Item) -> Result<Item> {
        match item {
            Item::Message(message) if message.is_request() => {
                Ok(match self.dispatch(&message, &ctx.info) {
                    Some(reply) => Item::Reply(reply),
                    None => Item::Handled,
                })
            }
            other => Ok(other),
        }
    }
}
