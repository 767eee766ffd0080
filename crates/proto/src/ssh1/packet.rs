//! SSH-1 protocol data units.
//!
//! A [`Packet`] is the decoded form of one wire message: a type byte and a
//! payload. Framing (length, padding, checksum, encryption) lives in
//! [`codec`](crate::ssh1::codec); this module only deals with the payload
//! and its typed fields.
//!
//! # Field encodings
//!
//! ```text
//! byte       1 octet
//! uint32     4 octets, big-endian
//! string     uint32 length followed by that many octets
//! mp-int     uint16 bit count followed by (bits + 7) / 8 octets, big-endian
//! ```
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh1::message::MessageType;
//! use tern_proto::ssh1::packet::Packet;
//!
//! let mut packet = Packet::new(MessageType::User);
//! packet.put_string(b"alice");
//!
//! let mut reader = packet.reader();
//! assert_eq!(reader.get_string().unwrap(), b"alice");
//! ```

use crate::ssh1::message::{self, MessageType};
use bytes::{BufMut, BytesMut};
use num_bigint::BigUint;
use tern_platform::{TernError, TernResult};

/// A single decoded SSH-1 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    msg_type: u8,
    payload: BytesMut,
}

impl Packet {
    /// Creates an empty packet of the given type.
    pub fn new(msg_type: MessageType) -> Self {
        Self::from_raw(msg_type as u8, BytesMut::new())
    }

    /// Creates a packet from a raw type byte and payload.
    pub fn from_raw(msg_type: u8, payload: impl Into<BytesMut>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
        }
    }

    /// Raw type byte.
    pub fn msg_type(&self) -> u8 {
        self.msg_type
    }

    /// Type as a known message, if it is one.
    pub fn message(&self) -> Option<MessageType> {
        MessageType::from_u8(self.msg_type)
    }

    /// Returns true if this packet has the given type.
    pub fn is(&self, msg_type: MessageType) -> bool {
        self.msg_type == msg_type as u8
    }

    /// Payload bytes (without the type byte).
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Appends a byte.
    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.payload.put_u8(value);
        self
    }

    /// Appends a big-endian 32-bit integer.
    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.payload.put_u32(value);
        self
    }

    /// Appends raw bytes without a length prefix.
    pub fn put_raw(&mut self, data: &[u8]) -> &mut Self {
        self.payload.put_slice(data);
        self
    }

    /// Appends a length-prefixed string.
    pub fn put_string(&mut self, data: &[u8]) -> &mut Self {
        self.payload.put_u32(data.len() as u32);
        self.payload.put_slice(data);
        self
    }

    /// Appends an SSH-1 multi-precision integer.
    pub fn put_mpint(&mut self, value: &BigUint) -> &mut Self {
        let bits = value.bits();
        self.payload.put_u16(bits as u16);
        if bits > 0 {
            self.payload.put_slice(&value.to_bytes_be());
        }
        self
    }

    /// Returns a cursor over the payload.
    pub fn reader(&self) -> PacketReader<'_> {
        PacketReader {
            msg_type: self.msg_type,
            buf: &self.payload,
        }
    }
}

impl std::fmt::Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{} bytes]",
            message::describe(self.msg_type),
            self.payload.len()
        )
    }
}

/// Typed cursor over a packet payload.
///
/// Every accessor fails with a protocol error instead of panicking when the
/// payload is shorter than the field.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    msg_type: u8,
    buf: &'a [u8],
}

impl<'a> PacketReader<'a> {
    fn take(&mut self, len: usize, what: &str) -> TernResult<&'a [u8]> {
        if self.buf.len() < len {
            return Err(TernError::Protocol(format!(
                "Truncated {} in {}: need {} bytes, have {}",
                what,
                message::describe(self.msg_type),
                len,
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Reads a byte.
    pub fn get_u8(&mut self) -> TernResult<u8> {
        Ok(self.take(1, "byte")?[0])
    }

    /// Reads a big-endian 16-bit integer.
    pub fn get_u16(&mut self) -> TernResult<u16> {
        let raw = self.take(2, "uint16")?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    /// Reads a big-endian 32-bit integer.
    pub fn get_u32(&mut self) -> TernResult<u32> {
        let raw = self.take(4, "uint32")?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Reads exactly `len` raw bytes.
    pub fn get_raw(&mut self, len: usize) -> TernResult<&'a [u8]> {
        self.take(len, "bytes")
    }

    /// Reads a length-prefixed string.
    pub fn get_string(&mut self) -> TernResult<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.take(len, "string")
    }

    /// Reads a length-prefixed string as text (lossy UTF-8).
    pub fn get_text(&mut self) -> TernResult<String> {
        Ok(String::from_utf8_lossy(self.get_string()?).into_owned())
    }

    /// Reads an SSH-1 multi-precision integer.
    pub fn get_mpint(&mut self) -> TernResult<BigUint> {
        let bits = self.get_u16()? as usize;
        let raw = self.take(bits.div_ceil(8), "mp-int")?;
        Ok(BigUint::from_bytes_be(raw))
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}
