use bytes::Bytes;
use std::net::SocketAddr;

use super::{codec, PROTOCOL_NUMBER};
use crate::core::{Result, Target};

/// Decoded form of the 36-byte message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Total message size, header included
    pub size: u16,
    /// 2-bit origin indicator
    pub origin: u8,
    /// Broadcast-style framing; set for discovery
    pub tagged: bool,
    /// Message carries a target address
    pub addressable: bool,
    /// 12-bit protocol number
    pub protocol: u16,
    /// Correlation identifier chosen by the sender
    pub source: u32,
    /// Device address, all-zero for any device
    pub target: Target,
    /// Peer should send a bare acknowledgement
    pub ack_required: bool,
    /// Peer should send a state reply
    pub res_required: bool,
    /// Per-device wrap-around sequence number
    pub sequence: u8,
    /// Message type code
    pub message_type: u16,
}

impl Header {
    /// Creates an outbound header
    ///
    /// `tagged` follows the target: the broadcast target is tagged, device targets are not.
    pub fn new(source: u32, target: Target, message_type: u16) -> Self {
        Header {
            size: 0,
            origin: 0,
            tagged: target.is_broadcast(),
            addressable: true,
            protocol: PROTOCOL_NUMBER,
            source,
            target,
            ack_required: false,
            res_required: false,
            sequence: 0,
            message_type,
        }
    }

    /// Overrides the tagged bit
    pub fn with_tagged(mut self, tagged: bool) -> Self {
        self.tagged = tagged;
        self
    }

    /// Sets the reply flags
    pub fn with_flags(mut self, ack_required: bool, res_required: bool) -> Self {
        self.ack_required = ack_required;
        self.res_required = res_required;
        self
    }

    /// Sets the sequence number
    pub fn with_sequence(mut self, sequence: u8) -> Self {
        self.sequence = sequence;
        self
    }
}

/// A header plus its opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub payload: Bytes,
}

impl Message {
    /// Creates a message; the size field is filled in on encode
    pub fn new(header: Header, payload: impl Into<Bytes>) -> Self {
        Message {
            header,
            payload: payload.into(),
        }
    }

    /// Encodes to wire bytes
    pub fn encode(&self) -> Result<Bytes> {
        codec::encode(&self.header, &self.payload)
    }

    /// Decodes from a complete datagram
    pub fn decode(datagram: &[u8]) -> Result<Self> {
        codec::decode_message(datagram)
    }
}

/// An inbound message together with the endpoint it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub message: Message,
    /// Sender address, when the transport knows it
    pub peer: Option<SocketAddr>,
}

impl Reply {
    pub fn source(&self) -> u32 {
        self.message.header.source
    }

    pub fn message_type(&self) -> u16 {
        self.message.header.message_type
    }

    pub fn target(&self) -> Target {
        self.message.header.target
    }

    pub fn payload(&self) -> &Bytes {
        &self.message.payload
    }
}
