//! Wire codec for the 36-byte header
//!
//! Layout, little-endian throughout:
//!
//! | bytes  | field                                                         |
//! |--------|---------------------------------------------------------------|
//! | 0..2   | total size                                                    |
//! | 2..4   | origin (2 bits), tagged, addressable, protocol (12 bits)      |
//! | 4..8   | source                                                        |
//! | 8..16  | target (6 bytes) followed by 2 zero bytes                     |
//! | 16..22 | reserved                                                      |
//! | 22     | reserved (6 bits), ack_required, res_required                 |
//! | 23     | sequence                                                      |
//! | 24..32 | reserved                                                      |
//! | 32..34 | message type                                                  |
//! | 34..36 | reserved                                                      |

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::message::{Header, Message};
use super::{HEADER_SIZE, LABEL_WIDTH, MAX_MESSAGE_SIZE};
use crate::core::{Error, Result, Target};

const TAGGED_BIT: u16 = 1 << 13;
const ADDRESSABLE_BIT: u16 = 1 << 12;
const PROTOCOL_MASK: u16 = 0x0fff;
const ACK_REQUIRED_BIT: u8 = 0b10;
const RES_REQUIRED_BIT: u8 = 0b01;

/// Encodes a header and payload into a fresh buffer of exactly `36 + payload.len()` bytes.
///
/// The size field is computed here; `header.size` is ignored.
pub fn encode(header: &Header, payload: &[u8]) -> Result<Bytes> {
    let size = HEADER_SIZE + payload.len();
    if size > MAX_MESSAGE_SIZE {
        return Err(Error::encode(format!(
            "message of {} bytes exceeds the {} byte limit",
            size, MAX_MESSAGE_SIZE
        )));
    }

    let mut buf = BytesMut::with_capacity(size);
    buf.put_u16_le(size as u16);

    let mut control = (u16::from(header.origin) & 0b11) << 14;
    if header.tagged {
        control |= TAGGED_BIT;
    }
    if header.addressable {
        control |= ADDRESSABLE_BIT;
    }
    control |= header.protocol & PROTOCOL_MASK;
    buf.put_u16_le(control);

    buf.put_u32_le(header.source);
    buf.put_slice(header.target.as_bytes());
    buf.put_bytes(0, 2);
    buf.put_bytes(0, 6);

    let mut flags = 0u8;
    if header.ack_required {
        flags |= ACK_REQUIRED_BIT;
    }
    if header.res_required {
        flags |= RES_REQUIRED_BIT;
    }
    buf.put_u8(flags);
    buf.put_u8(header.sequence);

    buf.put_u64_le(0);
    buf.put_u16_le(header.message_type);
    buf.put_u16_le(0);

    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Decodes the header of a complete datagram
///
/// Fails when the buffer is shorter than a header or when the declared size does not match
/// the buffer length.
pub fn decode_header(datagram: &[u8]) -> Result<Header> {
    if datagram.len() < HEADER_SIZE {
        return Err(Error::decode(format!(
            "datagram of {} bytes is shorter than the {} byte header",
            datagram.len(),
            HEADER_SIZE
        )));
    }

    let mut buf = datagram;
    let size = buf.get_u16_le();
    if usize::from(size) != datagram.len() {
        return Err(Error::decode(format!(
            "size field says {} bytes but datagram has {}",
            size,
            datagram.len()
        )));
    }

    let control = buf.get_u16_le();
    let source = buf.get_u32_le();

    let mut target = [0u8; 6];
    buf.copy_to_slice(&mut target);
    buf.advance(2 + 6);

    let flags = buf.get_u8();
    let sequence = buf.get_u8();
    buf.advance(8);
    let message_type = buf.get_u16_le();

    Ok(Header {
        size,
        origin: (control >> 14) as u8,
        tagged: control & TAGGED_BIT != 0,
        addressable: control & ADDRESSABLE_BIT != 0,
        protocol: control & PROTOCOL_MASK,
        source,
        target: Target(target),
        ack_required: flags & ACK_REQUIRED_BIT != 0,
        res_required: flags & RES_REQUIRED_BIT != 0,
        sequence,
        message_type,
    })
}

/// Decodes a whole datagram into header and payload
pub fn decode_message(datagram: &[u8]) -> Result<Message> {
    let header = decode_header(datagram)?;
    Ok(Message {
        header,
        payload: Bytes::copy_from_slice(&datagram[HEADER_SIZE..]),
    })
}

/// Shared read position for decoding consecutive fields of one payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldCursor {
    pub current: usize,
}

impl FieldCursor {
    pub fn new() -> Self {
        FieldCursor { current: 0 }
    }

    /// Borrows the next `width` bytes and moves past them
    pub fn take<'a>(&mut self, bytes: &'a [u8], width: usize) -> Result<&'a [u8]> {
        let end = self
            .current
            .checked_add(width)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                Error::decode(format!(
                    "field of {} bytes at offset {} runs past the {} byte payload",
                    width,
                    self.current,
                    bytes.len()
                ))
            })?;
        let field = &bytes[self.current..end];
        self.current = end;
        Ok(field)
    }

    pub fn read_u8(&mut self, bytes: &[u8]) -> Result<u8> {
        Ok(self.take(bytes, 1)?[0])
    }

    pub fn read_u16(&mut self, bytes: &[u8]) -> Result<u16> {
        Ok(self.take(bytes, 2)?.get_u16_le())
    }

    pub fn read_u32(&mut self, bytes: &[u8]) -> Result<u32> {
        Ok(self.take(bytes, 4)?.get_u32_le())
    }
}

/// Decodes a null-padded text field of `width` bytes
///
/// Text ends at the first null byte or at the field width. The cursor always advances by the
/// full width so the following field can be read with the same cursor.
pub fn decode_fixed_text(bytes: &[u8], cursor: &mut FieldCursor, width: usize) -> Result<String> {
    let field = cursor.take(bytes, width)?;
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    Ok(String::from_utf8_lossy(&field[..end]).into_owned())
}

/// Decodes a 32-byte label field
pub fn decode_state_label(bytes: &[u8], cursor: &mut FieldCursor) -> Result<String> {
    decode_fixed_text(bytes, cursor, LABEL_WIDTH)
}
