use serde::{Deserialize, Serialize};

use crate::buffer::FragmentBuffer;
use crate::common::{Id, PeerAddress};
use crate::{Error, Result};

use super::{bytes_to_sockaddr, sockaddr_to_bytes, Message, MessageType};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireHeader {
    #[serde(rename = "t")]
    pub message_id: u32,

    #[serde(rename = "v")]
    pub version: u32,

    #[serde(rename = "y")]
    pub message_type: u8,

    #[serde(rename = "c")]
    pub command: u8,

    #[serde(rename = "u")]
    pub is_udp: u8,

    #[serde(rename = "p")]
    pub has_payload: u8,

    #[serde(rename = "l")]
    pub payload_len: u32,

    #[serde(rename = "s", with = "serde_bytes")]
    pub sender_id: Vec<u8>,

    #[serde(rename = "sa", with = "serde_bytes")]
    pub sender_socket: Vec<u8>,

    #[serde(rename = "r", with = "serde_bytes")]
    pub recipient_id: Vec<u8>,

    #[serde(rename = "ra", with = "serde_bytes")]
    pub recipient_socket: Vec<u8>,
}

impl WireHeader {
    pub fn from_message(message: &Message) -> Result<WireHeader> {
        let payload_len = message.payload.as_ref().map_or(0, FragmentBuffer::len);
        let payload_len = u32::try_from(payload_len)
            .map_err(|_| Error::InvalidFrame("payload too large"))?;

        Ok(WireHeader {
            message_id: message.message_id,
            version: message.version,
            message_type: message.message_type.code(),
            command: message.command,
            is_udp: message.is_udp.into(),
            has_payload: message.payload.is_some().into(),
            payload_len,
            sender_id: message.sender.id.as_bytes().to_vec(),
            sender_socket: sockaddr_to_bytes(&message.sender.socket),
            recipient_id: message.recipient.id.as_bytes().to_vec(),
            recipient_socket: sockaddr_to_bytes(&message.recipient.socket),
        })
    }

    pub fn into_message(self, payload: Option<FragmentBuffer>) -> Result<Message> {
        Ok(Message {
            message_id: self.message_id,
            version: self.version,
            message_type: MessageType::from_code(self.message_type)?,
            command: self.command,
            sender: PeerAddress::new(
                Id::from_bytes(&self.sender_id)?,
                bytes_to_sockaddr(&self.sender_socket)?,
            ),
            recipient: PeerAddress::new(
                Id::from_bytes(&self.recipient_id)?,
                bytes_to_sockaddr(&self.recipient_socket)?,
            ),
            sender_socket: None,
            recipient_socket: None,
            is_udp: self.is_udp != 0,
            payload,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<WireHeader, serde_bencode::Error> {
        let obj = serde_bencode::from_bytes(bytes)?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}
