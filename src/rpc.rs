//! Built-in request handlers.

mod ping;

pub use ping::{PingHandler, PingRpc, PING_COMMAND};
