//! SSH-1 triple DES.
//!
//! Unlike outer-CBC 3DES, SSH-1 runs three complete DES-CBC chains back to
//! back, each with its own IV state:
//!
//! ```text
//! encrypt:  E(k1) -> D(k2) -> E(k3)
//! decrypt:  D(k3) -> E(k2) -> D(k1)
//! ```
//!
//! Keys are taken from `key[0..8]`, `key[8..16]` and `key[16..24]`. A 16-byte
//! key selects the two-key form, where `k3 = k1`.

use super::block::{bad_key, CbcChain};
use super::{not_keyed, Cipher, CipherKind, Direction};
use cipher::KeyInit;
use des::Des;
use tern_platform::{TernError, TernResult};

const KIND: CipherKind = CipherKind::TripleDes;

struct Cascade {
    direction: Direction,
    stages: [CbcChain<Des>; 3],
}

/// Inner-CBC triple DES.
#[derive(Default)]
pub struct TripleDesCbc {
    cascade: Option<Cascade>,
}

impl TripleDesCbc {
    /// Creates an unkeyed instance.
    pub fn new() -> Self {
        Self::default()
    }

    fn run(&mut self, want: Direction, data: &mut [u8]) -> TernResult<()> {
        match &mut self.cascade {
            Some(cascade) if cascade.direction == want => {
                for stage in cascade.stages.iter_mut() {
                    stage.process(KIND, data)?;
                }
                Ok(())
            }
            _ => Err(not_keyed(KIND, want)),
        }
    }
}

fn sub_keys(key: &[u8]) -> TernResult<[&[u8]; 3]> {
    match key.len() {
        16 => Ok([&key[..8], &key[8..16], &key[..8]]),
        len if len >= 24 => Ok([&key[..8], &key[8..16], &key[16..24]]),
        len => Err(TernError::Security(format!(
            "Key too short for {}: need 24 bytes, got {}",
            KIND, len
        ))),
    }
}

fn des(key: &[u8]) -> TernResult<Des> {
    Des::new_from_slice(key).map_err(|_| bad_key(KIND))
}

impl std::fmt::Debug for TripleDesCbc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TripleDesCbc")
            .field("direction", &self.cascade.as_ref().map(|c| c.direction))
            .finish_non_exhaustive()
    }
}

impl Cipher for TripleDesCbc {
    fn kind(&self) -> CipherKind {
        KIND
    }

    fn set_key(&mut self, direction: Direction, key: &[u8]) -> TernResult<()> {
        let [k1, k2, k3] = sub_keys(key)?;
        let stages = match direction {
            Direction::Encrypt => [
                CbcChain::new(des(k1)?, Direction::Encrypt),
                CbcChain::new(des(k2)?, Direction::Decrypt),
                CbcChain::new(des(k3)?, Direction::Encrypt),
            ],
            Direction::Decrypt => [
                CbcChain::new(des(k3)?, Direction::Decrypt),
                CbcChain::new(des(k2)?, Direction::Encrypt),
                CbcChain::new(des(k1)?, Direction::Decrypt),
            ],
        };
        self.cascade = Some(Cascade { direction, stages });
        Ok(())
    }

    fn encrypt(&mut self, data: &mut [u8]) -> TernResult<()> {
        self.run(Direction::Encrypt, data)
    }

    fn decrypt(&mut self, data: &mut [u8]) -> TernResult<()> {
        self.run(Direction::Decrypt, data)
    }
}

#[cfg(test)]
mod tests {
    use super::super::DesCbc;
    use super::*;

    #[test]
    fn test_equal_keys_degenerate_to_single_des() {
        // With k1 == k2 == k3 the first two stages cancel.
        let key = [0x5Au8; 24];
        let mut triple = TripleDesCbc::new();
        let mut single = DesCbc::new();
        triple.set_key(Direction::Encrypt, &key).unwrap();
        single.set_key(Direction::Encrypt, &key[..8]).unwrap();

        let mut a = [0x33u8; 32];
        let mut b = a;
        triple.encrypt(&mut a).unwrap();
        single.encrypt(&mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_two_key_form_reuses_first_key() {
        let mut key24 = [0u8; 24];
        for (i, byte) in key24.iter_mut().enumerate() {
            *byte = i as u8;
        }
        key24.copy_within(0..8, 16);

        let mut three = TripleDesCbc::new();
        let mut two = TripleDesCbc::new();
        three.set_key(Direction::Encrypt, &key24).unwrap();
        two.set_key(Direction::Encrypt, &key24[..16]).unwrap();

        let mut a = *b"0123456789abcdef";
        let mut b = a;
        three.encrypt(&mut a).unwrap();
        two.encrypt(&mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_round_trip() {
        let key: Vec<u8> = (100u8..132).collect();
        let mut enc = TripleDesCbc::new();
        let mut dec = TripleDesCbc::new();
        enc.set_key(Direction::Encrypt, &key).unwrap();
        dec.set_key(Direction::Decrypt, &key).unwrap();

        for _ in 0..4 {
            let mut data = *b"the quick brown fox jumps over!!";
            enc.encrypt(&mut data).unwrap();
            dec.decrypt(&mut data).unwrap();
            assert_eq!(&data, b"the quick brown fox jumps over!!");
        }
    }

    #[test]
    fn test_short_key() {
        let mut cipher = TripleDesCbc::new();
        assert!(cipher.set_key(Direction::Encrypt, &[0u8; 12]).is_err());
    }
}
