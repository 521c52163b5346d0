//! Addressing of a peer in the overlay.
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::common::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// A peer identity together with the socket it is reachable on.
pub struct PeerAddress {
    pub id: Id,
    pub socket: SocketAddr,
}

impl PeerAddress {
    /// Creates a new PeerAddress from an id and socket address.
    pub fn new(id: Id, socket: SocketAddr) -> PeerAddress {
        PeerAddress { id, socket }
    }

    /// A placeholder address used before the real recipient is known.
    pub fn unspecified() -> PeerAddress {
        PeerAddress {
            id: Id::default(),
            socket: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
        }
    }
}
