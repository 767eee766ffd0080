//! SSH-1 identity files (`SSH PRIVATE KEY FILE FORMAT 1.1`).
//!
//! ```text
//! "SSH PRIVATE KEY FILE FORMAT 1.1\n\0"
//! byte      cipher id (0 = none, 3 = 3des)
//! uint32    reserved
//! uint32    modulus bits
//! mp-int    n
//! mp-int    e
//! string    comment
//! -- encrypted from here on, zero padded to a multiple of 8 --
//! byte[4]   check bytes c1 c2 c1 c2
//! mp-int    d
//! mp-int    coefficient
//! mp-int    q
//! mp-int    p
//! ```
//!
//! The private part is encrypted with the cipher keyed from the passphrase
//! (see [`passphrase_key`](crate::ssh1::cipher::passphrase_key)). The check
//! bytes tell a wrong passphrase apart from a corrupt file.
//!
//! # Security
//!
//! Decrypted key material lives in [`Zeroizing`] buffers and is wiped once
//! the [`RsaPrivateKey`] has been built.

use crate::ssh1::cipher::{CipherKind, Direction, BLOCK_SIZE};
use crate::ssh1::packet::Packet;
use crate::ssh1::rsa::{RsaPrivateKey, RsaPublicKey};
use bytes::BytesMut;
use rand::RngCore;
use tern_platform::{IdentityMaterial, Interactor, TernError, TernResult};
use tracing::debug;
use zeroize::Zeroizing;

/// File magic, including the terminating NUL.
pub const IDENTITY_MAGIC: &[u8] = b"SSH PRIVATE KEY FILE FORMAT 1.1\n\0";

/// Cipher used when writing a passphrase-protected file.
pub const DEFAULT_FILE_CIPHER: CipherKind = CipherKind::TripleDes;

/// Public part of an identity file, readable without the passphrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityHeader {
    /// Cipher protecting the private part.
    pub cipher: CipherKind,
    /// Declared modulus size.
    pub bits: u32,
    /// Public key.
    pub public_key: RsaPublicKey,
    /// Free-form comment.
    pub comment: String,
}

impl IdentityHeader {
    /// Whether a passphrase is needed to load the file.
    pub fn is_encrypted(&self) -> bool {
        self.cipher != CipherKind::None
    }
}

/// A loaded RSA identity.
#[derive(Debug, Clone)]
pub struct Identity {
    key: RsaPrivateKey,
    comment: String,
}

fn malformed(err: TernError) -> TernError {
    TernError::Protocol(format!("Malformed identity file: {}", err))
}

fn as_packet(data: &[u8]) -> Packet {
    Packet::from_raw(0, BytesMut::from(data))
}

fn parse_header(data: &[u8]) -> TernResult<(IdentityHeader, usize)> {
    let body = data.strip_prefix(IDENTITY_MAGIC).ok_or_else(|| {
        TernError::Protocol("Not an SSH-1 identity file (bad magic)".to_string())
    })?;
    let packet = as_packet(body);
    let mut reader = packet.reader();

    let read = |reader: &mut crate::ssh1::packet::PacketReader<'_>| -> TernResult<_> {
        let cipher_id = reader.get_u8()?;
        let _reserved = reader.get_u32()?;
        let bits = reader.get_u32()?;
        let n = reader.get_mpint()?;
        let e = reader.get_mpint()?;
        let comment = reader.get_text()?;
        Ok((cipher_id, bits, n, e, comment))
    };
    let (cipher_id, bits, n, e, comment) = read(&mut reader).map_err(malformed)?;
    let cipher = CipherKind::from_id(cipher_id)?;
    let consumed = data.len() - reader.remaining();

    Ok((
        IdentityHeader {
            cipher,
            bits,
            public_key: RsaPublicKey::new(e, n),
            comment,
        },
        consumed,
    ))
}

impl Identity {
    /// Wraps a key.
    pub fn new(key: RsaPrivateKey, comment: impl Into<String>) -> Self {
        Self {
            key,
            comment: comment.into(),
        }
    }

    /// Reads the unencrypted header.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Protocol`] for a truncated or foreign file and
    /// [`TernError::Security`] for an unsupported cipher.
    pub fn header(data: &[u8]) -> TernResult<IdentityHeader> {
        parse_header(data).map(|(header, _)| header)
    }

    /// Parses and decrypts an identity file.
    ///
    /// # Errors
    ///
    /// - [`TernError::Authentication`] if the passphrase is wrong
    /// - [`TernError::Protocol`] if the file is malformed
    /// - [`TernError::Security`] if the key parameters are inconsistent
    pub fn load(data: &[u8], passphrase: &str) -> TernResult<Self> {
        let (header, offset) = parse_header(data)?;

        let mut private = Zeroizing::new(data[offset..].to_vec());
        if header.is_encrypted() {
            if private.len() % BLOCK_SIZE != 0 {
                return Err(TernError::Protocol(format!(
                    "Malformed identity file: encrypted part of {} bytes is not block aligned",
                    private.len()
                )));
            }
            let mut cipher = header.cipher.create();
            cipher.set_key_from_passphrase(Direction::Decrypt, passphrase)?;
            cipher.decrypt(&mut private)?;
        }

        if private.len() < 4 || private[0] != private[2] || private[1] != private[3] {
            return Err(TernError::Authentication(format!(
                "Bad passphrase for identity '{}'",
                header.comment
            )));
        }

        let packet = as_packet(&private[4..]);
        let mut reader = packet.reader();
        let mut read = || -> TernResult<_> {
            let d = reader.get_mpint()?;
            let coeff = reader.get_mpint()?;
            let q = reader.get_mpint()?;
            let p = reader.get_mpint()?;
            Ok((d, coeff, q, p))
        };
        let (d, coeff, q, p) = read().map_err(malformed)?;

        let key = RsaPrivateKey::from_components(
            header.public_key.modulus().clone(),
            header.public_key.exponent().clone(),
            d,
            p,
            q,
            coeff,
        )?;
        debug!(bits = header.bits, comment = %header.comment, "Loaded identity");
        Ok(Self {
            key,
            comment: header.comment,
        })
    }

    /// Serialises the identity, encrypting it if `passphrase` is non-empty.
    pub fn to_bytes(&self, passphrase: &str) -> TernResult<Vec<u8>> {
        let cipher_kind = if passphrase.is_empty() {
            CipherKind::None
        } else {
            DEFAULT_FILE_CIPHER
        };
        let public = self.key.public_key();

        let mut head = as_packet(IDENTITY_MAGIC);
        head.put_u8(cipher_kind.id())
            .put_u32(0)
            .put_u32(public.bits() as u32)
            .put_mpint(public.modulus())
            .put_mpint(public.exponent())
            .put_string(self.comment.as_bytes());

        let mut check = [0u8; 2];
        rand::thread_rng().fill_bytes(&mut check);
        let (p, q) = self.key.primes();
        let mut body = as_packet(&[check[0], check[1], check[0], check[1]]);
        body.put_mpint(self.key.private_exponent())
            .put_mpint(self.key.coefficient())
            .put_mpint(q)
            .put_mpint(p);

        let mut private = Zeroizing::new(body.payload().to_vec());
        let aligned = private.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        private.resize(aligned, 0);

        let mut cipher = cipher_kind.create();
        cipher.set_key_from_passphrase(Direction::Encrypt, passphrase)?;
        cipher.encrypt(&mut private)?;

        let mut out = head.payload().to_vec();
        out.extend_from_slice(&private);
        Ok(out)
    }

    /// The private key.
    pub fn key(&self) -> &RsaPrivateKey {
        &self.key
    }

    /// The file comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }
}

/// Loads the identity handed over by the authenticator, prompting for the
/// passphrase when the file is encrypted and none was supplied.
///
/// # Errors
///
/// Returns [`TernError::Authentication`] if the user cancels the prompt or
/// the passphrase is wrong, plus any error from [`Identity::load`].
pub async fn load_identity(
    material: &IdentityMaterial,
    interactor: &dyn Interactor,
) -> TernResult<Identity> {
    let header = Identity::header(&material.file)?;
    let passphrase = match (&material.passphrase, header.is_encrypted()) {
        (_, false) => Zeroizing::new(String::new()),
        (Some(known), true) => Zeroizing::new(known.clone()),
        (None, true) => {
            let prompt = format!("Passphrase for key '{}': ", header.comment);
            let entered = interactor.prompt_line(&prompt, false).await.ok_or_else(|| {
                TernError::Authentication("Passphrase entry cancelled".to_string())
            })?;
            Zeroizing::new(entered)
        }
    };
    Identity::load(&material.file, &passphrase)
}
