//! SSH-1 key exchange.
//!
//! The server opens with `SMSG_PUBLIC_KEY`:
//!
//! ```text
//! byte[8]   anti-spoofing cookie
//! uint32    server key bits     mp-int server key e     mp-int server key n
//! uint32    host key bits       mp-int host key e       mp-int host key n
//! uint32    protocol flags
//! uint32    supported ciphers mask
//! uint32    supported authentications mask
//! ```
//!
//! The client derives the session id as `MD5(host_n || server_n || cookie)`,
//! picks 32 random session key bytes, XORs the first 16 with the session id
//! and encrypts the result twice, first under the key with the smaller
//! modulus and then under the other one. `CMSG_SESSION_KEY` carries the
//! chosen cipher, the echoed cookie, the encrypted key and the client's
//! protocol flags.

use crate::ssh1::cipher::CipherKind;
use crate::ssh1::message::MessageType;
use crate::ssh1::packet::Packet;
use crate::ssh1::rsa::{to_fixed_bytes, RsaPrivateKey, RsaPublicKey};
use md5::{Digest, Md5};
use num_bigint::BigUint;
use rand::RngCore;
use tern_platform::{TernError, TernResult};
use zeroize::Zeroizing;

/// Minimum modulus size difference between the server and host keys.
pub const MIN_KEY_SIZE_DIFFERENCE: u64 = 24;

/// Session key length.
pub const SESSION_KEY_LEN: usize = 32;

/// Session id length.
pub const SESSION_ID_LEN: usize = 16;

/// Cookie length.
pub const COOKIE_LEN: usize = 8;

/// Protocol flag: X11 requests carry a screen number.
pub const FLAG_SCREEN_NUMBER: u32 = 1 << 0;

/// Protocol flag: port opens carry the originator's host description.
pub const FLAG_HOST_IN_FWD_OPEN: u32 = 1 << 1;

/// Protocol flags this client understands.
pub const CLIENT_PROTOCOL_FLAGS: u32 = FLAG_SCREEN_NUMBER | FLAG_HOST_IN_FWD_OPEN;

/// Optional protocol extensions agreed for the session.
///
/// Computed once from the server's flags; nothing else inspects raw bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// `CMSG_X11_REQUEST_FORWARDING` carries a screen number.
    pub screen_number: bool,
    /// `MSG_PORT_OPEN` carries an originator string.
    pub host_in_fwd_open: bool,
}

impl Capabilities {
    /// Intersects the server's flags with what this client supports.
    pub fn negotiate(server_flags: u32) -> Self {
        let agreed = server_flags & CLIENT_PROTOCOL_FLAGS;
        Self {
            screen_number: agreed & FLAG_SCREEN_NUMBER != 0,
            host_in_fwd_open: agreed & FLAG_HOST_IN_FWD_OPEN != 0,
        }
    }

    /// Back to wire bits.
    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.screen_number {
            bits |= FLAG_SCREEN_NUMBER;
        }
        if self.host_in_fwd_open {
            bits |= FLAG_HOST_IN_FWD_OPEN;
        }
        bits
    }
}

/// Contents of `SMSG_PUBLIC_KEY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKeys {
    /// Anti-spoofing cookie.
    pub cookie: [u8; COOKIE_LEN],
    /// Declared server key size.
    pub server_bits: u32,
    /// Short-lived server key.
    pub server_key: RsaPublicKey,
    /// Declared host key size.
    pub host_bits: u32,
    /// Long-lived host key.
    pub host_key: RsaPublicKey,
    /// Server protocol flags.
    pub protocol_flags: u32,
    /// Supported cipher bitmask.
    pub cipher_mask: u32,
    /// Supported authentication bitmask.
    pub auth_mask: u32,
}

impl ServerKeys {
    /// Parses `SMSG_PUBLIC_KEY`.
    pub fn parse(packet: &Packet) -> TernResult<Self> {
        let mut reader = packet.reader();
        let mut cookie = [0u8; COOKIE_LEN];
        cookie.copy_from_slice(reader.get_raw(COOKIE_LEN)?);

        let server_bits = reader.get_u32()?;
        let server_e = reader.get_mpint()?;
        let server_n = reader.get_mpint()?;
        let host_bits = reader.get_u32()?;
        let host_e = reader.get_mpint()?;
        let host_n = reader.get_mpint()?;

        Ok(Self {
            cookie,
            server_bits,
            server_key: RsaPublicKey::new(server_e, server_n),
            host_bits,
            host_key: RsaPublicKey::new(host_e, host_n),
            protocol_flags: reader.get_u32()?,
            cipher_mask: reader.get_u32()?,
            auth_mask: reader.get_u32()?,
        })
    }

    /// Builds `SMSG_PUBLIC_KEY`.
    pub fn to_packet(&self) -> Packet {
        let mut packet = Packet::new(MessageType::PublicKey);
        packet
            .put_raw(&self.cookie)
            .put_u32(self.server_bits)
            .put_mpint(self.server_key.exponent())
            .put_mpint(self.server_key.modulus())
            .put_u32(self.host_bits)
            .put_mpint(self.host_key.exponent())
            .put_mpint(self.host_key.modulus())
            .put_u32(self.protocol_flags)
            .put_u32(self.cipher_mask)
            .put_u32(self.auth_mask);
        packet
    }

    /// Rejects key pairs whose moduli are too close in size.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Security`] naming both sizes and the difference.
    pub fn check_key_sizes(&self) -> TernResult<()> {
        let server = self.server_key.bits();
        let host = self.host_key.bits();
        let difference = server.abs_diff(host);
        if difference < MIN_KEY_SIZE_DIFFERENCE {
            return Err(TernError::Security(format!(
                "Server key ({} bits) and host key ({} bits) differ by {} bits; at least {} required",
                server, host, difference, MIN_KEY_SIZE_DIFFERENCE
            )));
        }
        Ok(())
    }

    /// Session id for these keys.
    pub fn session_id(&self) -> [u8; SESSION_ID_LEN] {
        session_id(self.host_key.modulus(), self.server_key.modulus(), &self.cookie)
    }

    /// Whether the server accepts `cipher`.
    pub fn supports_cipher(&self, cipher: CipherKind) -> bool {
        self.cipher_mask & cipher.mask_bit() != 0
    }

    /// Agreed protocol extensions.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::negotiate(self.protocol_flags)
    }
}

/// `MD5(host_n || server_n || cookie)` with minimal big-endian moduli.
pub fn session_id(host_n: &BigUint, server_n: &BigUint, cookie: &[u8]) -> [u8; SESSION_ID_LEN] {
    let mut hasher = Md5::new();
    hasher.update(host_n.to_bytes_be());
    hasher.update(server_n.to_bytes_be());
    hasher.update(cookie);
    hasher.finalize().into()
}

/// The 32-byte symmetric session key.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey(Zeroizing<[u8; SESSION_KEY_LEN]>);

impl SessionKey {
    /// Generates a random key.
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; SESSION_KEY_LEN]);
        rand::thread_rng().fill_bytes(&mut key[..]);
        Self(key)
    }

    /// Wraps existing key bytes.
    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }

    fn mixed(&self, session_id: &[u8; SESSION_ID_LEN]) -> Zeroizing<[u8; SESSION_KEY_LEN]> {
        let mut mixed = self.0.clone();
        for (byte, id) in mixed.iter_mut().zip(session_id.iter()) {
            *byte ^= id;
        }
        mixed
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// Orders two keys by modulus, smaller first.
fn by_modulus<'a, T>(server: (&'a RsaPublicKey, T), host: (&'a RsaPublicKey, T)) -> [T; 2] {
    if server.0.modulus() < host.0.modulus() {
        [server.1, host.1]
    } else {
        [host.1, server.1]
    }
}

/// Encrypts the session key for `CMSG_SESSION_KEY`.
///
/// # Errors
///
/// Returns [`TernError::Security`] if the keys are too small for the two
/// PKCS#1 layers.
pub fn encrypt_session_key(
    key: &SessionKey,
    session_id: &[u8; SESSION_ID_LEN],
    server_key: &RsaPublicKey,
    host_key: &RsaPublicKey,
) -> TernResult<BigUint> {
    let [inner_key, outer_key] = by_modulus((server_key, server_key), (host_key, host_key));
    let mixed = key.mixed(session_id);
    let inner = inner_key.encrypt_pkcs1(&mixed[..])?;
    outer_key.encrypt_pkcs1(&inner.to_bytes_be())
}

/// Reverses [`encrypt_session_key`] with both private keys.
pub fn decrypt_session_key(
    value: &BigUint,
    session_id: &[u8; SESSION_ID_LEN],
    server_key: &RsaPrivateKey,
    host_key: &RsaPrivateKey,
) -> TernResult<SessionKey> {
    let [inner_key, outer_key] = by_modulus(
        (server_key.public_key(), server_key),
        (host_key.public_key(), host_key),
    );
    let inner = BigUint::from_bytes_be(&outer_key.decrypt_pkcs1(value)?);
    let plain = inner_key.decrypt_pkcs1(&inner)?;
    if plain.len() > SESSION_KEY_LEN {
        return Err(TernError::Security(format!(
            "Session key of {} bytes, expected {}",
            plain.len(),
            SESSION_KEY_LEN
        )));
    }
    let plain = to_fixed_bytes(&BigUint::from_bytes_be(&plain), SESSION_KEY_LEN);

    let mut bytes = [0u8; SESSION_KEY_LEN];
    bytes.copy_from_slice(&plain);
    let mixed = SessionKey::from_bytes(bytes);
    Ok(SessionKey(mixed.mixed(session_id)))
}

/// Builds `CMSG_SESSION_KEY`.
pub fn session_key_packet(
    cipher: CipherKind,
    cookie: &[u8; COOKIE_LEN],
    encrypted_key: &BigUint,
    protocol_flags: u32,
) -> Packet {
    let mut packet = Packet::new(MessageType::SessionKey);
    packet
        .put_u8(cipher.id())
        .put_raw(cookie)
        .put_mpint(encrypted_key)
        .put_u32(protocol_flags);
    packet
}
