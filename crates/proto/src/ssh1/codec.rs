//! SSH-1 binary packet framing.
//!
//! # Wire Format
//!
//! ```text
//! uint32    length            type + payload + 4, before padding
//! byte[p]   padding           p = 8 - (length % 8), so 1..=8 bytes
//! byte      type
//! byte[n]   payload
//! uint32    crc               CRC-32 over padding, type and payload
//! ```
//!
//! Everything after the length field is encrypted as one run once a cipher is
//! active. The padding is random under encryption and zero otherwise. With
//! compression on, `type || payload` is replaced by its compressed form and
//! `length` describes that.
//!
//! # Security
//!
//! - The CRC is checked before any byte of the packet is interpreted
//! - A length whose padded size exceeds [`MAX_PACKET_SIZE`] is rejected before
//!   anything is buffered for it
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh1::codec::{encode, Decoded, PacketDecoder};
//! use tern_proto::ssh1::cipher::NoCipher;
//! use tern_proto::ssh1::message::MessageType;
//! use tern_proto::ssh1::packet::Packet;
//!
//! let mut packet = Packet::new(MessageType::StdinData);
//! packet.put_string(b"ls\n");
//! let wire = encode(&packet, &mut NoCipher, None).unwrap();
//!
//! let mut decoder = PacketDecoder::new();
//! decoder.feed(&wire);
//! match decoder.next().unwrap() {
//!     Decoded::Complete(decoded) => assert_eq!(decoded, packet),
//!     Decoded::NeedMore(_) => unreachable!(),
//! }
//! ```

use crate::ssh1::cipher::{Cipher, CipherKind, NoCipher};
use crate::ssh1::compress::{Compressor, Decompressor};
use crate::ssh1::message::{self, MessageType};
use crate::ssh1::packet::Packet;
use bytes::{Buf, BufMut, BytesMut};
use crc::{Algorithm, Crc};
use rand::RngCore;
use tern_platform::{TernError, TernResult};
use tracing::{debug, trace};

/// Largest padded packet accepted from the peer.
pub const MAX_PACKET_SIZE: usize = 256_000;

/// Smallest legal length field: type byte plus CRC.
pub const MIN_LENGTH: usize = 5;

const LENGTH_FIELD: usize = 4;
const CRC_LEN: usize = 4;

/// SSH-1's CRC-32: the reflected IEEE polynomial with zero init and no final
/// xor.
pub const SSH1_CRC32: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x04c1_1db7,
    init: 0x0000_0000,
    refin: true,
    refout: true,
    xorout: 0x0000_0000,
    check: 0x2dfd_2d88,
    residue: 0x0000_0000,
};

static CRC: Crc<u32> = Crc::<u32>::new(&SSH1_CRC32);

/// Computes the SSH-1 CRC-32 of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    CRC.checksum(data)
}

/// Bytes following the length field for a given length: padding, body, CRC.
pub fn padded_size(length: usize) -> usize {
    length + (8 - length % 8)
}

fn check_length(length: usize) -> TernResult<()> {
    if length < MIN_LENGTH {
        return Err(TernError::Protocol(format!(
            "Packet length {} below minimum {}",
            length, MIN_LENGTH
        )));
    }
    if padded_size(length) > MAX_PACKET_SIZE {
        return Err(TernError::Protocol(format!(
            "Corrupted packet: padded size {} exceeds {} bytes",
            padded_size(length),
            MAX_PACKET_SIZE
        )));
    }
    Ok(())
}

/// Frames a packet for the wire.
///
/// # Errors
///
/// Returns [`TernError::Protocol`] if the framed packet would exceed
/// [`MAX_PACKET_SIZE`], or the cipher/compressor error.
pub fn encode(
    packet: &Packet,
    cipher: &mut dyn Cipher,
    compressor: Option<&mut Compressor>,
) -> TernResult<BytesMut> {
    let mut body = Vec::with_capacity(1 + packet.payload().len());
    body.push(packet.msg_type());
    body.extend_from_slice(packet.payload());
    if let Some(compressor) = compressor {
        body = compressor.compress(&body)?;
    }

    let length = body.len() + CRC_LEN;
    check_length(length)?;
    let pad_len = padded_size(length) - length;

    let mut buf = BytesMut::with_capacity(LENGTH_FIELD + padded_size(length));
    buf.put_u32(length as u32);

    let mut padding = [0u8; 8];
    if cipher.kind() != CipherKind::None {
        rand::thread_rng().fill_bytes(&mut padding[..pad_len]);
    }
    buf.put_slice(&padding[..pad_len]);
    buf.put_slice(&body);

    let crc = crc32(&buf[LENGTH_FIELD..]);
    buf.put_u32(crc);

    cipher.encrypt(&mut buf[LENGTH_FIELD..])?;
    Ok(buf)
}

/// Decodes a single complete wire packet.
///
/// Unlike [`PacketDecoder`] this does not skip debug or ignore messages.
///
/// # Errors
///
/// Returns [`TernError::Protocol`] if `bytes` is not exactly one well-formed
/// packet.
pub fn decode(
    bytes: &[u8],
    cipher: &mut dyn Cipher,
    decompressor: Option<&mut Decompressor>,
) -> TernResult<Packet> {
    if bytes.len() < LENGTH_FIELD {
        return Err(TernError::Protocol("Packet shorter than its length field".to_string()));
    }
    let length = (&bytes[..LENGTH_FIELD]).get_u32() as usize;
    check_length(length)?;
    let expected = LENGTH_FIELD + padded_size(length);
    if bytes.len() != expected {
        return Err(TernError::Protocol(format!(
            "Packet size mismatch: length field implies {} bytes, got {}",
            expected,
            bytes.len()
        )));
    }
    let mut block = bytes[LENGTH_FIELD..].to_vec();
    open_block(length, &mut block, cipher, decompressor)
}

/// Decrypts, verifies and unpacks the bytes following a length field.
fn open_block(
    length: usize,
    block: &mut [u8],
    cipher: &mut dyn Cipher,
    decompressor: Option<&mut Decompressor>,
) -> TernResult<Packet> {
    cipher.decrypt(block)?;

    let (covered, trailer) = block.split_at(block.len() - CRC_LEN);
    let received = (&trailer[..]).get_u32();
    let computed = crc32(covered);
    if received != computed {
        return Err(TernError::Protocol(format!(
            "Corrupted check bytes on input: CRC 0x{:08x}, expected 0x{:08x}",
            received, computed
        )));
    }

    let pad_len = padded_size(length) - length;
    let body = &covered[pad_len..];
    let inflated;
    let body = match decompressor {
        Some(decompressor) => {
            inflated = decompressor.decompress(body)?;
            &inflated[..]
        }
        None => body,
    };

    let (&msg_type, payload) = body
        .split_first()
        .ok_or_else(|| TernError::Protocol("Packet has no type byte".to_string()))?;
    Ok(Packet::from_raw(msg_type, payload))
}

/// Result of one incremental decode step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// At least this many more bytes are needed.
    NeedMore(usize),
    /// A full packet was decoded.
    Complete(Packet),
}

/// Incremental packet decoder.
///
/// Owns the inbound cipher and decompressor. Bytes are fed as they arrive and
/// packets are pulled out one at a time, so a cipher switch takes effect
/// exactly at the next packet boundary. Debug and ignore messages never leave
/// the decoder.
pub struct PacketDecoder {
    buffer: BytesMut,
    pending_length: Option<usize>,
    cipher: Box<dyn Cipher>,
    decompressor: Option<Decompressor>,
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketDecoder {
    /// Creates a decoder with no cipher and no compression.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            pending_length: None,
            cipher: Box::new(NoCipher),
            decompressor: None,
        }
    }

    /// Installs the inbound cipher for every following packet.
    pub fn set_cipher(&mut self, cipher: Box<dyn Cipher>) {
        self.cipher = cipher;
    }

    /// Turns on decompression for every following packet.
    pub fn enable_compression(&mut self, decompressor: Decompressor) {
        self.decompressor = Some(decompressor);
    }

    /// Appends received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Takes the undecoded bytes, e.g. data that arrived together with the
    /// identification line.
    pub fn take_buffered(&mut self) -> BytesMut {
        self.pending_length = None;
        self.buffer.split()
    }

    /// Decodes the next packet, skipping debug and ignore messages.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Protocol`] on a bad length or CRC. The decoder
    /// must not be used after an error.
    pub fn next(&mut self) -> TernResult<Decoded> {
        loop {
            let packet = match self.next_raw()? {
                Decoded::Complete(packet) => packet,
                need => return Ok(need),
            };
            match packet.message() {
                Some(MessageType::Debug) => {
                    let text = packet.reader().get_text().unwrap_or_default();
                    debug!(message = %text, "Remote debug message");
                }
                Some(MessageType::Ignore) => {
                    trace!(bytes = packet.payload().len(), "Skipping ignore message");
                }
                _ => return Ok(Decoded::Complete(packet)),
            }
        }
    }

    /// Decodes the next packet without filtering.
    pub fn next_raw(&mut self) -> TernResult<Decoded> {
        let length = match self.pending_length {
            Some(length) => length,
            None => {
                if self.buffer.len() < LENGTH_FIELD {
                    return Ok(Decoded::NeedMore(LENGTH_FIELD - self.buffer.len()));
                }
                let length = self.buffer.get_u32() as usize;
                check_length(length)?;
                self.pending_length = Some(length);
                length
            }
        };

        let needed = padded_size(length);
        if self.buffer.len() < needed {
            return Ok(Decoded::NeedMore(needed - self.buffer.len()));
        }

        self.pending_length = None;
        let mut block = self.buffer.split_to(needed);
        let packet = open_block(
            length,
            &mut block,
            self.cipher.as_mut(),
            self.decompressor.as_mut(),
        )?;
        trace!(packet = %packet, "Decoded packet");
        Ok(Decoded::Complete(packet))
    }
}

impl std::fmt::Debug for PacketDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketDecoder")
            .field("buffered", &self.buffer.len())
            .field("pending_length", &self.pending_length)
            .field("cipher", &self.cipher.kind())
            .field("compression", &self.decompressor.is_some())
            .finish()
    }
}

/// Outbound half of the pipeline: cipher and compressor for the send path.
pub struct PacketEncoder {
    cipher: Box<dyn Cipher>,
    compressor: Option<Compressor>,
}

impl Default for PacketEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketEncoder {
    /// Creates an encoder with no cipher and no compression.
    pub fn new() -> Self {
        Self {
            cipher: Box::new(NoCipher),
            compressor: None,
        }
    }

    /// Installs the outbound cipher for every following packet.
    pub fn set_cipher(&mut self, cipher: Box<dyn Cipher>) {
        self.cipher = cipher;
    }

    /// Turns on compression for every following packet.
    pub fn enable_compression(&mut self, compressor: Compressor) {
        self.compressor = Some(compressor);
    }

    /// Frames one packet.
    pub fn encode(&mut self, packet: &Packet) -> TernResult<BytesMut> {
        encode(packet, self.cipher.as_mut(), self.compressor.as_mut())
    }
}

impl std::fmt::Debug for PacketEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketEncoder")
            .field("cipher", &self.cipher.kind())
            .field("compression", &self.compressor.is_some())
            .finish()
    }
}

/// Checks a received packet against the type the caller is waiting for.
///
/// # Errors
///
/// - [`TernError::Disconnected`] with the server's reason for `MSG_DISCONNECT`
/// - [`TernError::Protocol`] for any other mismatch
pub fn expect_type(packet: Packet, expected: MessageType) -> TernResult<Packet> {
    if packet.is(expected) {
        return Ok(packet);
    }
    check_disconnect(&packet)?;
    Err(TernError::Protocol(format!(
        "Expected {}, got {}",
        expected,
        message::describe(packet.msg_type())
    )))
}

/// Turns `MSG_DISCONNECT` into [`TernError::Disconnected`].
pub fn check_disconnect(packet: &Packet) -> TernResult<()> {
    if packet.is(MessageType::Disconnect) {
        let reason = packet
            .reader()
            .get_text()
            .unwrap_or_else(|_| "no reason given".to_string());
        return Err(TernError::Disconnected(reason));
    }
    Ok(())
}
