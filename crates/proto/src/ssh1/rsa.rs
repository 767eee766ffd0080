//! RSA arithmetic for SSH-1.
//!
//! SSH-1 uses raw RSA with PKCS#1 v1.5 block formatting in two places: the
//! client encrypts the session key to the server, and the server challenges
//! the client to decrypt a random number under the user's key.
//!
//! ```text
//! 00 || BT || PS || 00 || D
//! ```
//!
//! `BT` is the block type: 1 pads with `0xFF`, 2 pads with random non-zero
//! bytes. `PS` is at least 8 bytes, and the block is exactly as long as the
//! modulus.

use num_bigint::BigUint;
use num_traits::{One, Zero};
use rand::RngCore;
use tern_platform::{HostKeyInfo, TernError, TernResult};

/// PKCS#1 block type used for signatures (`0xFF` padding).
pub const BLOCK_TYPE_PRIVATE: u8 = 1;

/// PKCS#1 block type used for encryption (random padding).
pub const BLOCK_TYPE_PUBLIC: u8 = 2;

/// Overhead of the PKCS#1 block: two leading bytes, eight padding bytes and
/// the zero separator.
pub const PKCS1_OVERHEAD: usize = 11;

/// Computes `input^exponent mod modulus`.
pub fn encrypt_public(input: &BigUint, modulus: &BigUint, exponent: &BigUint) -> BigUint {
    input.modpow(exponent, modulus)
}

/// Private-key operation through the Chinese Remainder Theorem.
///
/// `coeff` must be `q^-1 mod p`.
pub fn decrypt_private_crt(
    input: &BigUint,
    p: &BigUint,
    q: &BigUint,
    dp: &BigUint,
    dq: &BigUint,
    coeff: &BigUint,
) -> BigUint {
    let s1 = input.modpow(dp, p);
    let s2 = input.modpow(dq, q);
    // (s1 - s2) mod p without going negative
    let diff = (s1 + p - (&s2 % p)) % p;
    let h = (coeff * diff) % p;
    s2 + h * q
}

/// Formats `input` as a PKCS#1 block of exactly `modulus_bytes` bytes.
///
/// # Errors
///
/// Returns [`TernError::Security`] if the block type is not 1 or 2, or if
/// `input` does not fit with at least eight padding bytes.
pub fn pad_pkcs1(input: &[u8], block_type: u8, modulus_bytes: usize) -> TernResult<Vec<u8>> {
    if input.len() + PKCS1_OVERHEAD > modulus_bytes {
        return Err(TernError::Security(format!(
            "PKCS#1 input of {} bytes does not fit a {}-byte modulus",
            input.len(),
            modulus_bytes
        )));
    }

    let pad_len = modulus_bytes - 3 - input.len();
    let mut block = Vec::with_capacity(modulus_bytes);
    block.push(0);
    block.push(block_type);

    match block_type {
        BLOCK_TYPE_PRIVATE => block.resize(2 + pad_len, 0xFF),
        BLOCK_TYPE_PUBLIC => {
            let mut padding = vec![0u8; pad_len];
            let mut rng = rand::thread_rng();
            rng.fill_bytes(&mut padding);
            for byte in padding.iter_mut() {
                while *byte == 0 {
                    *byte = (rng.next_u32() & 0xFF) as u8;
                }
            }
            block.extend_from_slice(&padding);
        }
        other => {
            return Err(TernError::Security(format!(
                "Unsupported PKCS#1 block type {}",
                other
            )))
        }
    }

    block.push(0);
    block.extend_from_slice(input);
    Ok(block)
}

/// Removes PKCS#1 formatting from a block.
///
/// `block` may be shorter than `modulus_bytes` (leading zeros dropped by the
/// integer conversion); it is left-padded before checking.
///
/// # Errors
///
/// Returns [`TernError::Security`] naming the failed check: leading byte,
/// block type, padding byte or missing separator.
pub fn strip_pkcs1(block: &[u8], block_type: u8, modulus_bytes: usize) -> TernResult<Vec<u8>> {
    if block.len() > modulus_bytes {
        return Err(TernError::Security(format!(
            "PKCS#1 block of {} bytes exceeds {}-byte modulus",
            block.len(),
            modulus_bytes
        )));
    }
    let block = left_pad(block, modulus_bytes);

    if modulus_bytes < PKCS1_OVERHEAD || block[0] != 0 {
        return Err(TernError::Security(
            "PKCS#1 block does not start with a zero byte".to_string(),
        ));
    }
    if block[1] != block_type {
        return Err(TernError::Security(format!(
            "PKCS#1 block type {} does not match expected {}",
            block[1], block_type
        )));
    }

    let body = &block[2..];
    let separator = body
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| TernError::Security("PKCS#1 zero separator not found".to_string()))?;

    if block_type == BLOCK_TYPE_PRIVATE {
        if let Some(bad) = body[..separator].iter().find(|&&b| b != 0xFF) {
            return Err(TernError::Security(format!(
                "PKCS#1 type 1 padding byte 0x{:02x} is not 0xff",
                bad
            )));
        }
    }
    if separator < PKCS1_OVERHEAD - 3 {
        return Err(TernError::Security(format!(
            "PKCS#1 padding too short: {} bytes",
            separator
        )));
    }

    Ok(body[separator + 1..].to_vec())
}

/// Big-endian bytes of `value`, left-padded with zeros to `len`.
pub fn to_fixed_bytes(value: &BigUint, len: usize) -> Vec<u8> {
    if value.is_zero() {
        return vec![0; len];
    }
    left_pad(&value.to_bytes_be(), len)
}

fn left_pad(bytes: &[u8], len: usize) -> Vec<u8> {
    if bytes.len() >= len {
        return bytes.to_vec();
    }
    let mut out = vec![0u8; len - bytes.len()];
    out.extend_from_slice(bytes);
    out
}

/// An RSA public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPublicKey {
    exponent: BigUint,
    modulus: BigUint,
}

impl RsaPublicKey {
    /// Creates a public key.
    pub fn new(exponent: BigUint, modulus: BigUint) -> Self {
        Self { exponent, modulus }
    }

    /// Public exponent.
    pub fn exponent(&self) -> &BigUint {
        &self.exponent
    }

    /// Modulus.
    pub fn modulus(&self) -> &BigUint {
        &self.modulus
    }

    /// Modulus size in bits.
    pub fn bits(&self) -> u64 {
        self.modulus.bits()
    }

    /// Modulus size in bytes.
    pub fn modulus_bytes(&self) -> usize {
        self.bits().div_ceil(8) as usize
    }

    /// PKCS#1 type 2 pads `data` and encrypts it.
    pub fn encrypt_pkcs1(&self, data: &[u8]) -> TernResult<BigUint> {
        let block = pad_pkcs1(data, BLOCK_TYPE_PUBLIC, self.modulus_bytes())?;
        let input = BigUint::from_bytes_be(&block);
        Ok(encrypt_public(&input, &self.modulus, &self.exponent))
    }

    /// Converts to the form handed to the host-key verifier.
    pub fn host_key_info(&self, declared_bits: u32) -> HostKeyInfo {
        HostKeyInfo {
            bits: declared_bits,
            exponent: self.exponent.to_bytes_be(),
            modulus: self.modulus.to_bytes_be(),
        }
    }
}

/// An RSA private key with CRT parameters.
#[derive(Clone)]
pub struct RsaPrivateKey {
    public: RsaPublicKey,
    d: BigUint,
    p: BigUint,
    q: BigUint,
    dp: BigUint,
    dq: BigUint,
    qinv: BigUint,
}

impl RsaPrivateKey {
    /// Builds a private key and normalises its CRT parameters.
    ///
    /// `coeff` is expected to be `q^-1 mod p`. Key files disagree on which
    /// prime is which, so if `coeff` is instead `p^-1 mod q` the primes are
    /// swapped, and if it matches neither it is recomputed.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Security`] if `p * q != n` or a prime is trivial.
    pub fn from_components(
        n: BigUint,
        e: BigUint,
        d: BigUint,
        p: BigUint,
        q: BigUint,
        coeff: BigUint,
    ) -> TernResult<Self> {
        let one = BigUint::one();
        if p <= one || q <= one || &p * &q != n {
            return Err(TernError::Security(
                "RSA private key primes do not match the modulus".to_string(),
            ));
        }

        let (p, q, qinv) = if (&coeff * &q) % &p == one {
            (p, q, coeff)
        } else if (&coeff * &p) % &q == one {
            (q, p, coeff)
        } else {
            let qinv = q.modinv(&p).ok_or_else(|| {
                TernError::Security("RSA primes are not coprime".to_string())
            })?;
            (p, q, qinv)
        };

        let dp = &d % (&p - &one);
        let dq = &d % (&q - &one);

        Ok(Self {
            public: RsaPublicKey::new(e, n),
            d,
            p,
            q,
            dp,
            dq,
            qinv,
        })
    }

    /// The public half.
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Raw private operation (CRT).
    pub fn decrypt_raw(&self, input: &BigUint) -> BigUint {
        decrypt_private_crt(input, &self.p, &self.q, &self.dp, &self.dq, &self.qinv)
    }

    /// Raw private operation with the full exponent, without CRT.
    pub fn decrypt_direct(&self, input: &BigUint) -> BigUint {
        input.modpow(&self.d, self.public.modulus())
    }

    /// Decrypts and strips a PKCS#1 type 2 block.
    pub fn decrypt_pkcs1(&self, input: &BigUint) -> TernResult<Vec<u8>> {
        if input >= self.public.modulus() {
            return Err(TernError::Security(
                "RSA input is not smaller than the modulus".to_string(),
            ));
        }
        let plain = self.decrypt_raw(input);
        let len = self.public.modulus_bytes();
        strip_pkcs1(&to_fixed_bytes(&plain, len), BLOCK_TYPE_PUBLIC, len)
    }

    /// `q^-1 mod p` after normalisation.
    pub fn coefficient(&self) -> &BigUint {
        &self.qinv
    }

    /// The primes after normalisation.
    pub fn primes(&self) -> (&BigUint, &BigUint) {
        (&self.p, &self.q)
    }

    /// Full private exponent.
    pub fn private_exponent(&self) -> &BigUint {
        &self.d
    }
}

impl std::fmt::Debug for RsaPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaPrivateKey")
            .field("bits", &self.public.bits())
            .field("private", &"<redacted>")
            .finish()
    }
}
