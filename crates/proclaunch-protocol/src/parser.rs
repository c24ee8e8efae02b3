//! Incremental frame parser
//!
//! Bytes arrive in arbitrary chunks. [`PacketParser`] buffers them and only
//! consumes a frame once all of it is present, so calling [`PacketParser::parse`]
//! after every read is always safe.

use crate::error::{ProtocolError, Result};
use crate::packet::{HEADER_SIZE, MAX_PACKET_SIZE, Packet, PacketType, SIZE_FIELD_LEN};
use crate::token::Token;
use bytes::{Buf, Bytes, BytesMut};

/// A complete frame whose payload has not been decoded yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    /// Frame type
    pub packet_type: PacketType,
    /// Frame token
    pub token: Token,
    /// Undecoded payload
    pub payload: Bytes,
}

impl RawPacket {
    /// Decode the payload into a typed packet
    pub fn decode(self) -> Result<Packet> {
        Packet::deserialize(self.packet_type, self.token, self.payload)
    }
}

/// Reassembles frames from a byte stream
#[derive(Debug, Default)]
pub struct PacketParser {
    buf: BytesMut,
}

impl PacketParser {
    /// Create an empty parser
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Receive buffer, for readers that fill it in place
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Number of bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete frame off the buffer
    ///
    /// Returns `Ok(None)` while the frame is still incomplete. Errors are
    /// fatal: the stream cannot be resynchronized afterwards.
    pub fn parse(&mut self) -> Result<Option<RawPacket>> {
        if self.buf.len() < SIZE_FIELD_LEN {
            return Ok(None);
        }

        let size = (&self.buf[..SIZE_FIELD_LEN]).get_u32_le();
        if !(HEADER_SIZE..=MAX_PACKET_SIZE).contains(&(size as usize)) {
            return Err(ProtocolError::InvalidPacketSize(size));
        }

        // The buffer grows with the reads, not with the declared size.
        let total = SIZE_FIELD_LEN + size as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        let type_byte = self.buf[SIZE_FIELD_LEN];
        let packet_type =
            PacketType::from_u8(type_byte).ok_or(ProtocolError::UnknownPacketType(type_byte))?;

        let mut frame = self.buf.split_to(total).freeze();
        frame.advance(SIZE_FIELD_LEN + 1);
        let token = Token::new(frame.get_u64_le());

        Ok(Some(RawPacket {
            packet_type,
            token,
            payload: frame,
        }))
    }
}
