//! Main Crate Error

use crate::common::{Id, MessageType};

#[derive(thiserror::Error, Debug)]
/// Peerwire crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to parse message header: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    /// Indicates that an [Id] was built from the wrong number of bytes.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// Indicates that the bytes of a frame could not be decoded.
    #[error("Invalid frame: {0}")]
    InvalidFrame(&'static str),

    /// Indicates an unknown message type code on the wire.
    #[error("Invalid message type code: {0}")]
    InvalidMessageType(u8),

    /// The channel was closed before or during the operation.
    #[error("Channel is closed")]
    ChannelClosed,

    /// A stream channel was used before [crate::channel::StreamChannel::connect].
    #[error("Stream channel is not connected")]
    NotConnected,

    /// [crate::channel::StreamChannel::connect] was called twice.
    #[error("Stream channel is already connected")]
    AlreadyConnected,

    /// The peer answered with a failure type.
    #[error("Request answered with {0:?}")]
    Rejected(MessageType),

    /// No response arrived within the request timeout.
    #[error("Request timed out")]
    Timeout,

    /// A pipeline stage or a notification handler failed.
    #[error("Handler failed: {0}")]
    Handler(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Reasons a request could not be routed to a [crate::dispatch::RequestHandler].
pub enum DispatchError {
    /// Nothing is registered for this identity and command.
    #[error("No handler registered for command {command} on behalf of {on_behalf_of:?}")]
    NoHandler { on_behalf_of: Id, command: u8 },

    /// The requester speaks another protocol version.
    #[error("Version mismatch, expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    /// Only request messages can be dispatched.
    #[error("Message is not a request")]
    NotARequest,
}

/// Crate result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
