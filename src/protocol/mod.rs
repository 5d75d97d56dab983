//! Protocol implementation module
//!
//! This module defines the LAN protocol header, the message and reply types, and the
//! pure encode/decode functions for the fixed binary wire layout.

pub mod codec;
pub mod message;

pub use self::codec::{
    decode_fixed_text, decode_header, decode_message, decode_state_label, encode, FieldCursor,
};
pub use self::message::{Header, Message, Reply};

/// Encoded header length in bytes
pub const HEADER_SIZE: usize = 36;

/// Largest encodable message, bounded by the 16-bit size field
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Protocol number carried in every outbound header
pub const PROTOCOL_NUMBER: u16 = 1024;

/// Width of fixed-length text fields such as labels
pub const LABEL_WIDTH: usize = 32;

/// Service code advertised for the UDP service in StateService replies
pub const SERVICE_UDP: u8 = 1;

/// Message type codes used by the client itself
pub mod message_type {
    /// Discovery probe
    pub const GET_SERVICE: u16 = 2;
    /// Discovery reply: service (u8) and port (u32)
    pub const STATE_SERVICE: u16 = 3;
    /// Label query
    pub const GET_LABEL: u16 = 23;
    /// Label reply: 32-byte text field
    pub const STATE_LABEL: u16 = 25;
    /// Bare acknowledgement
    pub const ACKNOWLEDGEMENT: u16 = 45;
}
