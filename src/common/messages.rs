//! Request and response envelopes, and their frame encoding.
//!
//! A frame is `header_len: u32 | bencoded header | payload`. The header is
//! small and always copied into one segment. The payload segments are
//! referenced, never copied.

mod internal;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::buffer::{FragmentBuffer, ReadBuffer, Readable};
use crate::common::PeerAddress;
use crate::{Error, Result};

/// Largest header we are willing to parse.
pub const MAX_HEADER_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Request, expecting a reply.
    Request1,
    Request2,
    Request3,
    Request4,
    /// Request that must never be answered.
    RequestFireForget1,
    RequestFireForget2,
    Ok,
    PartiallyOk,
    NotFound,
    Denied,
    /// No handler for the command or identity.
    UnknownId,
    Exception,
    Cancel,
    User1,
    User2,
}

impl MessageType {
    pub fn code(&self) -> u8 {
        match self {
            MessageType::Request1 => 0,
            MessageType::Request2 => 1,
            MessageType::Request3 => 2,
            MessageType::Request4 => 3,
            MessageType::RequestFireForget1 => 4,
            MessageType::RequestFireForget2 => 5,
            MessageType::Ok => 6,
            MessageType::PartiallyOk => 7,
            MessageType::NotFound => 8,
            MessageType::Denied => 9,
            MessageType::UnknownId => 10,
            MessageType::Exception => 11,
            MessageType::Cancel => 12,
            MessageType::User1 => 13,
            MessageType::User2 => 14,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => MessageType::Request1,
            1 => MessageType::Request2,
            2 => MessageType::Request3,
            3 => MessageType::Request4,
            4 => MessageType::RequestFireForget1,
            5 => MessageType::RequestFireForget2,
            6 => MessageType::Ok,
            7 => MessageType::PartiallyOk,
            8 => MessageType::NotFound,
            9 => MessageType::Denied,
            10 => MessageType::UnknownId,
            11 => MessageType::Exception,
            12 => MessageType::Cancel,
            13 => MessageType::User1,
            14 => MessageType::User2,
            other => return Err(Error::InvalidMessageType(other)),
        })
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            MessageType::Request1
                | MessageType::Request2
                | MessageType::Request3
                | MessageType::Request4
                | MessageType::RequestFireForget1
                | MessageType::RequestFireForget2
        )
    }

    pub fn is_fire_and_forget(&self) -> bool {
        matches!(
            self,
            MessageType::RequestFireForget1 | MessageType::RequestFireForget2
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Correlation id, echoed by the response.
    pub message_id: u32,
    /// Protocol version of the sender.
    pub version: u32,
    pub message_type: MessageType,
    /// Command identifier used for dispatch.
    pub command: u8,
    pub sender: PeerAddress,
    pub recipient: PeerAddress,
    /// The socket this message was received from, as observed by the transport.
    /// Not sent over the wire.
    pub sender_socket: Option<SocketAddr>,
    /// The local socket this message was received on. Not sent over the wire.
    pub recipient_socket: Option<SocketAddr>,
    /// True for datagram transport, false for stream transport.
    pub is_udp: bool,
    pub payload: Option<FragmentBuffer>,
}

impl Message {
    /// Request skeleton from `sender` to `recipient`.
    ///
    /// The message id is left at zero, channels assign one when the request
    /// is correlated with a response.
    pub fn request(
        sender: PeerAddress,
        recipient: PeerAddress,
        command: u8,
        message_type: MessageType,
        version: u32,
    ) -> Message {
        Message {
            message_id: 0,
            version,
            message_type,
            command,
            sender,
            recipient,
            sender_socket: None,
            recipient_socket: None,
            is_udp: true,
            payload: None,
        }
    }

    /// Response skeleton to `request`.
    ///
    /// Copies the correlation id, command, version and transport kind, swaps
    /// the socket pairing and addresses the request's sender. Only the type and
    /// the sender identity differ.
    pub fn response(request: &Message, reply_type: MessageType, sender: PeerAddress) -> Message {
        Message {
            message_id: request.message_id,
            version: request.version,
            message_type: reply_type,
            command: request.command,
            sender,
            recipient: request.sender,
            sender_socket: request.recipient_socket,
            recipient_socket: request.sender_socket,
            is_udp: request.is_udp,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: FragmentBuffer) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_message_id(mut self, message_id: u32) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn with_udp(mut self, is_udp: bool) -> Self {
        self.is_udp = is_udp;
        self
    }

    pub fn is_request(&self) -> bool {
        self.message_type.is_request()
    }

    /// Where a channel should send this message.
    ///
    /// Replies go back to the observed socket of the request, everything else
    /// to the socket the recipient advertises.
    pub fn destination(&self) -> SocketAddr {
        self.recipient_socket.unwrap_or(self.recipient.socket)
    }

    // === Frame encoding ===

    /// Encodes into frame bytes. The payload is appended by reference.
    pub fn encode(&self) -> Result<FragmentBuffer> {
        let header = internal::WireHeader::from_message(self)?.to_bytes()?;

        let mut head = BytesMut::with_capacity(4 + header.len());
        head.put_u32(header.len() as u32);
        head.extend_from_slice(&header);

        let frame = FragmentBuffer::new();
        frame.push(head.freeze());
        if let Some(payload) = &self.payload {
            frame.add(payload);
        }

        Ok(frame)
    }

    /// Decodes one whole frame, consuming it from `frame`.
    pub fn decode(frame: &mut ReadBuffer) -> Result<Message> {
        let header_len = frame
            .get_u32()
            .ok_or(Error::InvalidFrame("missing header length"))? as usize;

        if header_len > MAX_HEADER_SIZE {
            return Err(Error::InvalidFrame("header too large"));
        }
        if frame.readable_bytes() < header_len {
            return Err(Error::InvalidFrame("truncated header"));
        }

        let header = FragmentBuffer::new();
        header.transfer_from(frame, header_len);
        let header = internal::WireHeader::from_bytes(&header.to_bytes())?;

        let remaining = frame.readable_bytes();
        if remaining != header.payload_len as usize {
            return Err(Error::InvalidFrame("payload length mismatch"));
        }

        let payload = if header.has_payload != 0 {
            let payload = FragmentBuffer::new();
            payload.transfer_from(frame, remaining);
            payload.reset_already_transferred();
            Some(payload)
        } else {
            None
        };

        header.into_message(payload)
    }
}

pub(crate) fn sockaddr_to_bytes(sockaddr: &SocketAddr) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(18);

    match sockaddr.ip() {
        IpAddr::V4(v4) => bytes.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => bytes.extend_from_slice(&v6.octets()),
    };

    bytes.extend_from_slice(&sockaddr.port().to_be_bytes());

    bytes
}

pub(crate) fn bytes_to_sockaddr<T: AsRef<[u8]>>(bytes: T) -> Result<SocketAddr> {
    let bytes = bytes.as_ref();
    let (ip, port): (IpAddr, &[u8]) = match bytes.len() {
        6 => (
            Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]).into(),
            &bytes[4..6],
        ),
        18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[..16]);
            (Ipv6Addr::from(octets).into(), &bytes[16..18])
        }
        _ => return Err(Error::InvalidFrame("wrong number of bytes for socket address")),
    };

    Ok(SocketAddr::new(ip, u16::from_be_bytes([port[0], port[1]])))
}

/// Payload convenience for tests and handlers working on small messages.
pub fn payload_bytes(message: &Message) -> Bytes {
    message
        .payload
        .as_ref()
        .map(FragmentBuffer::to_bytes)
        .unwrap_or_default()
}
