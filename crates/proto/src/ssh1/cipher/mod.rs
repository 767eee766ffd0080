//! SSH-1 symmetric ciphers.
//!
//! Every cipher is an independent struct behind the [`Cipher`] trait and is
//! selected from its negotiated id through [`CipherKind`]. Each instance
//! serves a single direction: the session keeps one keyed for encryption on
//! the send path and one keyed for decryption on the receive path.
//!
//! | id | name       | construction                                   |
//! |----|------------|------------------------------------------------|
//! | 0  | `none`     | identity                                       |
//! | 1  | `idea`     | IDEA in CFB mode                               |
//! | 2  | `des`      | DES in CBC mode                                |
//! | 3  | `3des`     | three DES-CBC chains, E-D-E / D-E-D            |
//! | 6  | `blowfish` | Blowfish in CBC mode, little-endian words      |
//!
//! All chains start from an all-zero IV and keep their state across packets.
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh1::cipher::{CipherKind, Direction};
//!
//! let key = [7u8; 32];
//! let mut send = CipherKind::TripleDes.create();
//! let mut recv = CipherKind::TripleDes.create();
//! send.set_key(Direction::Encrypt, &key).unwrap();
//! recv.set_key(Direction::Decrypt, &key).unwrap();
//!
//! let mut data = *b"sixteen byte msg";
//! send.encrypt(&mut data).unwrap();
//! recv.decrypt(&mut data).unwrap();
//! assert_eq!(&data, b"sixteen byte msg");
//! ```

mod block;
mod triple_des;

pub use block::{BlowfishCbc, DesCbc, IdeaCfb};
pub use triple_des::TripleDesCbc;

use cipher::generic_array::{typenum::U8, GenericArray};
use md5::{Digest, Md5};
use tern_platform::{TernError, TernResult};
use zeroize::Zeroizing;

/// Block size shared by every SSH-1 cipher.
pub const BLOCK_SIZE: usize = 8;

pub(crate) type Block = GenericArray<u8, U8>;

/// Which way an instance transforms data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Outbound (client to server)
    Encrypt,
    /// Inbound (server to client)
    Decrypt,
}

/// Uniform contract over the SSH-1 ciphers.
pub trait Cipher: Send {
    /// Which cipher this is.
    fn kind(&self) -> CipherKind;

    /// Keys the instance for one direction and resets its chain to a zero IV.
    ///
    /// Only the first [`CipherKind::key_size`] bytes of `key` are used.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Security`] if `key` is too short.
    fn set_key(&mut self, direction: Direction, key: &[u8]) -> TernResult<()>;

    /// Encrypts `data` in place. `data.len()` must be a multiple of 8.
    fn encrypt(&mut self, data: &mut [u8]) -> TernResult<()>;

    /// Decrypts `data` in place. `data.len()` must be a multiple of 8.
    fn decrypt(&mut self, data: &mut [u8]) -> TernResult<()>;

    /// Encrypts `src` into `dst` (same length).
    fn encrypt_into(&mut self, src: &[u8], dst: &mut [u8]) -> TernResult<()> {
        copy_same_len(src, dst)?;
        self.encrypt(dst)
    }

    /// Decrypts `src` into `dst` (same length).
    fn decrypt_into(&mut self, src: &[u8], dst: &mut [u8]) -> TernResult<()> {
        copy_same_len(src, dst)?;
        self.decrypt(dst)
    }

    /// Keys the instance from a passphrase instead of raw key bytes.
    fn set_key_from_passphrase(&mut self, direction: Direction, passphrase: &str) -> TernResult<()> {
        let key = passphrase_key(passphrase, self.kind().key_size());
        self.set_key(direction, &key)
    }
}

/// Negotiable SSH-1 cipher identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum CipherKind {
    /// No encryption
    None = 0,
    /// IDEA-CFB
    Idea = 1,
    /// DES-CBC
    Des = 2,
    /// Inner-CBC triple DES
    TripleDes = 3,
    /// Blowfish-CBC
    Blowfish = 6,
}

/// Names of every id the protocol defines, supported or not.
const CIPHER_NAMES: [&str; 7] = ["none", "idea", "des", "3des", "tss", "rc4", "blowfish"];

impl CipherKind {
    /// Every supported cipher, strongest first.
    pub const ALL: [CipherKind; 5] = [
        CipherKind::TripleDes,
        CipherKind::Blowfish,
        CipherKind::Idea,
        CipherKind::Des,
        CipherKind::None,
    ];

    /// Looks a cipher up by negotiated id.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Security`] for ids that are defined but not
    /// supported (`tss`, `rc4`) and for unknown ids.
    pub fn from_id(id: u8) -> TernResult<Self> {
        match id {
            0 => Ok(CipherKind::None),
            1 => Ok(CipherKind::Idea),
            2 => Ok(CipherKind::Des),
            3 => Ok(CipherKind::TripleDes),
            6 => Ok(CipherKind::Blowfish),
            other => Err(TernError::Security(format!(
                "Cipher {} is not supported",
                display_name(other)
            ))),
        }
    }

    /// Looks a cipher up by name.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Security`] if the name is unknown or unsupported.
    pub fn from_name(name: &str) -> TernResult<Self> {
        let id = CIPHER_NAMES
            .iter()
            .position(|candidate| candidate.eq_ignore_ascii_case(name))
            .ok_or_else(|| TernError::Security(format!("Unknown cipher '{}'", name)))?;
        Self::from_id(id as u8)
    }

    /// Negotiated id.
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Protocol name.
    pub fn name(self) -> &'static str {
        CIPHER_NAMES[self as usize]
    }

    /// Key bytes consumed from the session key.
    pub fn key_size(self) -> usize {
        match self {
            CipherKind::None => 0,
            CipherKind::Idea => 16,
            CipherKind::Des => 8,
            CipherKind::TripleDes => 24,
            CipherKind::Blowfish => 32,
        }
    }

    /// Bit for this cipher in the server's supported-cipher mask.
    pub fn mask_bit(self) -> u32 {
        1 << self.id()
    }

    /// Creates an unkeyed instance.
    pub fn create(self) -> Box<dyn Cipher> {
        match self {
            CipherKind::None => Box::new(NoCipher),
            CipherKind::Idea => Box::new(IdeaCfb::new()),
            CipherKind::Des => Box::new(DesCbc::new()),
            CipherKind::TripleDes => Box::new(TripleDesCbc::new()),
            CipherKind::Blowfish => Box::new(BlowfishCbc::new()),
        }
    }
}

impl std::fmt::Display for CipherKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Human-readable name for any cipher id, used in negotiation errors.
pub fn display_name(id: u8) -> String {
    match CIPHER_NAMES.get(id as usize) {
        Some(name) => format!("'{}' (id {})", name, id),
        None => format!("id {}", id),
    }
}

/// Derives `len` key bytes from a passphrase: MD5 of the phrase, repeated
/// and truncated.
pub fn passphrase_key(passphrase: &str, len: usize) -> Zeroizing<Vec<u8>> {
    let digest = Md5::digest(passphrase.as_bytes());
    let key: Vec<u8> = digest.iter().copied().cycle().take(len).collect();
    Zeroizing::new(key)
}

/// The `none` cipher.
#[derive(Debug, Default)]
pub struct NoCipher;

impl Cipher for NoCipher {
    fn kind(&self) -> CipherKind {
        CipherKind::None
    }

    fn set_key(&mut self, _direction: Direction, _key: &[u8]) -> TernResult<()> {
        Ok(())
    }

    fn encrypt(&mut self, _data: &mut [u8]) -> TernResult<()> {
        Ok(())
    }

    fn decrypt(&mut self, _data: &mut [u8]) -> TernResult<()> {
        Ok(())
    }
}

fn copy_same_len(src: &[u8], dst: &mut [u8]) -> TernResult<()> {
    if src.len() != dst.len() {
        return Err(TernError::Security(format!(
            "Cipher buffer length mismatch: source {} bytes, destination {} bytes",
            src.len(),
            dst.len()
        )));
    }
    dst.copy_from_slice(src);
    Ok(())
}

pub(crate) fn key_slice<'a>(kind: CipherKind, key: &'a [u8]) -> TernResult<&'a [u8]> {
    key.get(..kind.key_size()).ok_or_else(|| {
        TernError::Security(format!(
            "Key too short for {}: need {} bytes, got {}",
            kind,
            kind.key_size(),
            key.len()
        ))
    })
}

/// Runs `op` over each 8-byte block of `data`.
pub(crate) fn for_each_block<F>(kind: CipherKind, data: &mut [u8], mut op: F) -> TernResult<()>
where
    F: FnMut(&mut Block),
{
    if data.len() % BLOCK_SIZE != 0 {
        return Err(TernError::Security(format!(
            "{} input of {} bytes is not a multiple of the block size",
            kind,
            data.len()
        )));
    }
    for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
        op(GenericArray::from_mut_slice(chunk));
    }
    Ok(())
}

pub(crate) fn not_keyed(kind: CipherKind, direction: Direction) -> TernError {
    TernError::Security(format!("{} is not keyed for {:?}", kind, direction))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pair(kind: CipherKind, key: &[u8]) -> (Box<dyn Cipher>, Box<dyn Cipher>) {
        let mut enc = kind.create();
        let mut dec = kind.create();
        enc.set_key(Direction::Encrypt, key).unwrap();
        dec.set_key(Direction::Decrypt, key).unwrap();
        (enc, dec)
    }

    #[test]
    fn test_lookup_by_id() {
        assert_eq!(CipherKind::from_id(3).unwrap(), CipherKind::TripleDes);
        assert_eq!(CipherKind::from_id(6).unwrap(), CipherKind::Blowfish);
        assert_eq!(CipherKind::TripleDes.name(), "3des");
        assert_eq!(CipherKind::Blowfish.mask_bit(), 0x40);
    }

    #[test]
    fn test_unsupported_ids_are_hard_errors() {
        let err = CipherKind::from_id(5).err().unwrap();
        assert!(matches!(err, TernError::Security(_)));
        assert!(err.to_string().contains("'rc4'"));

        let err = CipherKind::from_id(4).err().unwrap();
        assert!(err.to_string().contains("'tss'"));

        let err = CipherKind::from_id(42).err().unwrap();
        assert!(err.to_string().contains("id 42"));
    }

    #[test]
    fn test_lookup_by_name() {
        assert_eq!(CipherKind::from_name("blowfish").unwrap(), CipherKind::Blowfish);
        assert_eq!(CipherKind::from_name("3DES").unwrap(), CipherKind::TripleDes);
        assert!(CipherKind::from_name("rc4").is_err());
        assert!(CipherKind::from_name("aes128-ctr").is_err());
    }

    #[test]
    fn test_passphrase_key_replicates_digest() {
        let key = passphrase_key("secret", 24);
        assert_eq!(key.len(), 24);
        assert_eq!(&key[..8], &key[16..24]);

        let short = passphrase_key("secret", 8);
        assert_eq!(&short[..], &key[..8]);
    }

    #[test]
    fn test_every_cipher_round_trips_across_packets() {
        let key: Vec<u8> = (0u8..32).collect();
        for kind in CipherKind::ALL {
            let (mut enc, mut dec) = pair(kind, &key);
            for packet in 0..3u8 {
                let plain: Vec<u8> = (0..64).map(|i| i ^ packet).collect();
                let mut data = plain.clone();
                enc.encrypt(&mut data).unwrap();
                if kind != CipherKind::None {
                    assert_ne!(data, plain, "{} left data unchanged", kind);
                }
                dec.decrypt(&mut data).unwrap();
                assert_eq!(data, plain, "{} packet {}", kind, packet);
            }
        }
    }

    #[test]
    fn test_chain_state_persists() {
        let key = [9u8; 32];
        let (mut enc, _) = pair(CipherKind::Des, &key);
        let mut first = [0u8; 8];
        let mut second = [0u8; 8];
        enc.encrypt(&mut first).unwrap();
        enc.encrypt(&mut second).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_buffer_to_buffer() {
        let key = [3u8; 32];
        let (mut enc, mut dec) = pair(CipherKind::Blowfish, &key);
        let src = [0x55u8; 16];
        let mut mid = [0u8; 16];
        let mut out = [0u8; 16];
        enc.encrypt_into(&src, &mut mid).unwrap();
        dec.decrypt_into(&mid, &mut out).unwrap();
        assert_eq!(out, src);

        assert!(enc.encrypt_into(&src, &mut [0u8; 8]).is_err());
    }

    #[test]
    fn test_partial_block_rejected() {
        let (mut enc, _) = pair(CipherKind::Des, &[1u8; 8]);
        assert!(enc.encrypt(&mut [0u8; 7]).is_err());
    }

    #[test]
    fn test_wrong_direction_rejected() {
        let (mut enc, mut dec) = pair(CipherKind::Idea, &[1u8; 16]);
        assert!(enc.decrypt(&mut [0u8; 8]).is_err());
        assert!(dec.encrypt(&mut [0u8; 8]).is_err());
    }

    #[test]
    fn test_short_key_rejected() {
        let mut cipher = CipherKind::TripleDes.create();
        let err = cipher.set_key(Direction::Encrypt, &[0u8; 8]).unwrap_err();
        assert!(err.to_string().contains("need 24 bytes"));
    }

    #[test]
    fn test_passphrase_keyed_pair() {
        let mut enc = CipherKind::TripleDes.create();
        let mut dec = CipherKind::TripleDes.create();
        enc.set_key_from_passphrase(Direction::Encrypt, "hunter2").unwrap();
        dec.set_key_from_passphrase(Direction::Decrypt, "hunter2").unwrap();

        let mut data = *b"identity file!!!";
        enc.encrypt(&mut data).unwrap();
        dec.decrypt(&mut data).unwrap();
        assert_eq!(&data, b"identity file!!!");
    }

    /// DES weak keys with the parity bits cleared.
    const WEAK_DES_KEYS: [[u8; 8]; 4] = [
        [0x00; 8],
        [0xfe; 8],
        [0xe0, 0xe0, 0xe0, 0xe0, 0xf0, 0xf0, 0xf0, 0xf0],
        [0x1e, 0x1e, 0x1e, 0x1e, 0x0e, 0x0e, 0x0e, 0x0e],
    ];

    fn is_weak_des_key(key: &[u8]) -> bool {
        WEAK_DES_KEYS
            .iter()
            .any(|weak| key.iter().zip(weak).all(|(k, w)| k & 0xfe == *w))
    }

    fn block_aligned() -> impl Strategy<Value = Vec<u8>> {
        (1usize..64).prop_flat_map(|blocks| proptest::collection::vec(any::<u8>(), blocks * 8))
    }

    proptest! {
        #[test]
        fn prop_every_cipher_round_trips_for_random_keys(
            kind_index in 0usize..CipherKind::ALL.len(),
            key in proptest::collection::vec(any::<u8>(), 32),
            packets in proptest::collection::vec(block_aligned(), 1..4),
        ) {
            let kind = CipherKind::ALL[kind_index];
            let (mut enc, mut dec) = pair(kind, &key);
            for plain in packets {
                let mut data = plain.clone();
                enc.encrypt(&mut data).unwrap();
                dec.decrypt(&mut data).unwrap();
                prop_assert_eq!(data, plain, "{} with key {:02x?}", kind, key);
            }
        }

        #[test]
        fn prop_triple_des_encrypting_twice_is_not_identity(
            key in proptest::collection::vec(any::<u8>(), 24),
            plain in block_aligned(),
        ) {
            prop_assume!(!key.chunks(8).any(is_weak_des_key));
            let encrypt_once = |input: &[u8]| {
                let mut cipher = CipherKind::TripleDes.create();
                cipher.set_key(Direction::Encrypt, &key).unwrap();
                let mut data = input.to_vec();
                cipher.encrypt(&mut data).unwrap();
                data
            };
            let once = encrypt_once(&plain);
            let twice = encrypt_once(&once);
            prop_assert_ne!(&once, &plain);
            prop_assert_ne!(&twice, &plain);

            let mut dec = CipherKind::TripleDes.create();
            dec.set_key(Direction::Decrypt, &key).unwrap();
            let mut back = once;
            dec.decrypt(&mut back).unwrap();
            prop_assert_eq!(back, plain);
        }
    }
}
