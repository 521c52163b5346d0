#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

pub mod buffer;
pub mod channel;
mod common;
mod config;
pub mod dispatch;
mod error;
pub mod maintenance;
pub mod pipeline;
pub mod rpc;

pub use crate::buffer::{FragmentBuffer, ReadBuffer, Readable};
pub use crate::common::{messages, Id, Message, MessageType, PeerAddress, ID_SIZE};
pub use crate::config::*;
pub use crate::error::{DispatchError, Error, Result};
pub use bytes::Bytes;
