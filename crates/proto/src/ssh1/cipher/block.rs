//! Single block ciphers: DES-CBC, Blowfish-CBC and IDEA-CFB.

use super::{for_each_block, key_slice, not_keyed, Block, Cipher, CipherKind, Direction};
use blowfish::Blowfish;
use cipher::{
    typenum::U8, BlockCipher, BlockDecryptMut, BlockEncryptMut, BlockSizeUser, InnerIvInit,
    KeyInit,
};
use des::Des;
use idea::Idea;
use tern_platform::{TernError, TernResult};

/// One CBC chain running in a fixed direction.
pub(crate) enum CbcChain<C>
where
    C: BlockEncryptMut + BlockDecryptMut + BlockCipher,
{
    Encrypt(cbc::Encryptor<C>),
    Decrypt(cbc::Decryptor<C>),
}

impl<C> CbcChain<C>
where
    C: BlockEncryptMut + BlockDecryptMut + BlockCipher + BlockSizeUser<BlockSize = U8>,
{
    pub(crate) fn new(inner: C, direction: Direction) -> Self {
        let iv = Block::default();
        match direction {
            Direction::Encrypt => CbcChain::Encrypt(cbc::Encryptor::inner_iv_init(inner, &iv)),
            Direction::Decrypt => CbcChain::Decrypt(cbc::Decryptor::inner_iv_init(inner, &iv)),
        }
    }

    /// Runs the chain over `data` in its own direction.
    pub(crate) fn process(&mut self, kind: CipherKind, data: &mut [u8]) -> TernResult<()> {
        match self {
            CbcChain::Encrypt(enc) => for_each_block(kind, data, |block| enc.encrypt_block_mut(block)),
            CbcChain::Decrypt(dec) => for_each_block(kind, data, |block| dec.decrypt_block_mut(block)),
        }
    }
}

pub(crate) fn bad_key(kind: CipherKind) -> TernError {
    TernError::Security(format!("Invalid {} key", kind))
}

fn run_chain<C>(
    state: &mut Option<(Direction, CbcChain<C>)>,
    kind: CipherKind,
    want: Direction,
    data: &mut [u8],
) -> TernResult<()>
where
    C: BlockEncryptMut + BlockDecryptMut + BlockCipher + BlockSizeUser<BlockSize = U8>,
{
    match state {
        Some((direction, chain)) if *direction == want => chain.process(kind, data),
        _ => Err(not_keyed(kind, want)),
    }
}

/// DES in CBC mode.
#[derive(Default)]
pub struct DesCbc {
    state: Option<(Direction, CbcChain<Des>)>,
}

impl DesCbc {
    /// Creates an unkeyed instance.
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for DesCbc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DesCbc")
            .field("direction", &self.state.as_ref().map(|(d, _)| *d))
            .finish_non_exhaustive()
    }
}

impl Cipher for DesCbc {
    fn kind(&self) -> CipherKind {
        CipherKind::Des
    }

    fn set_key(&mut self, direction: Direction, key: &[u8]) -> TernResult<()> {
        let key = key_slice(CipherKind::Des, key)?;
        let des = Des::new_from_slice(key).map_err(|_| bad_key(CipherKind::Des))?;
        self.state = Some((direction, CbcChain::new(des, direction)));
        Ok(())
    }

    fn encrypt(&mut self, data: &mut [u8]) -> TernResult<()> {
        run_chain(&mut self.state, CipherKind::Des, Direction::Encrypt, data)
    }

    fn decrypt(&mut self, data: &mut [u8]) -> TernResult<()> {
        run_chain(&mut self.state, CipherKind::Des, Direction::Decrypt, data)
    }
}

/// Blowfish in CBC mode.
///
/// SSH-1 feeds Blowfish little-endian 32-bit words, so every word is byte
/// swapped on the way in and out of the standard big-endian implementation.
#[derive(Default)]
pub struct BlowfishCbc {
    state: Option<(Direction, CbcChain<Blowfish>)>,
}

impl BlowfishCbc {
    /// Creates an unkeyed instance.
    pub fn new() -> Self {
        Self::default()
    }

    fn run(&mut self, want: Direction, data: &mut [u8]) -> TernResult<()> {
        swap_words(data);
        let result = run_chain(&mut self.state, CipherKind::Blowfish, want, data);
        swap_words(data);
        result
    }
}

fn swap_words(data: &mut [u8]) {
    for word in data.chunks_exact_mut(4) {
        word.reverse();
    }
}

impl std::fmt::Debug for BlowfishCbc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlowfishCbc")
            .field("direction", &self.state.as_ref().map(|(d, _)| *d))
            .finish_non_exhaustive()
    }
}

impl Cipher for BlowfishCbc {
    fn kind(&self) -> CipherKind {
        CipherKind::Blowfish
    }

    fn set_key(&mut self, direction: Direction, key: &[u8]) -> TernResult<()> {
        let key = key_slice(CipherKind::Blowfish, key)?;
        let blowfish: Blowfish =
            Blowfish::new_from_slice(key).map_err(|_| bad_key(CipherKind::Blowfish))?;
        self.state = Some((direction, CbcChain::new(blowfish, direction)));
        Ok(())
    }

    fn encrypt(&mut self, data: &mut [u8]) -> TernResult<()> {
        self.run(Direction::Encrypt, data)
    }

    fn decrypt(&mut self, data: &mut [u8]) -> TernResult<()> {
        self.run(Direction::Decrypt, data)
    }
}

enum CfbChain {
    Encrypt(cfb_mode::Encryptor<Idea>),
    Decrypt(cfb_mode::Decryptor<Idea>),
}

/// IDEA in 64-bit cipher feedback mode.
#[derive(Default)]
pub struct IdeaCfb {
    state: Option<CfbChain>,
}

impl IdeaCfb {
    /// Creates an unkeyed instance.
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for IdeaCfb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let direction = self.state.as_ref().map(|chain| match chain {
            CfbChain::Encrypt(_) => Direction::Encrypt,
            CfbChain::Decrypt(_) => Direction::Decrypt,
        });
        f.debug_struct("IdeaCfb")
            .field("direction", &direction)
            .finish_non_exhaustive()
    }
}

impl Cipher for IdeaCfb {
    fn kind(&self) -> CipherKind {
        CipherKind::Idea
    }

    fn set_key(&mut self, direction: Direction, key: &[u8]) -> TernResult<()> {
        let key = key_slice(CipherKind::Idea, key)?;
        let idea = Idea::new_from_slice(key).map_err(|_| bad_key(CipherKind::Idea))?;
        let iv = Block::default();
        self.state = Some(match direction {
            Direction::Encrypt => CfbChain::Encrypt(cfb_mode::Encryptor::inner_iv_init(idea, &iv)),
            Direction::Decrypt => CfbChain::Decrypt(cfb_mode::Decryptor::inner_iv_init(idea, &iv)),
        });
        Ok(())
    }

    fn encrypt(&mut self, data: &mut [u8]) -> TernResult<()> {
        match &mut self.state {
            Some(CfbChain::Encrypt(enc)) => {
                for_each_block(CipherKind::Idea, data, |block| enc.encrypt_block_mut(block))
            }
            _ => Err(not_keyed(CipherKind::Idea, Direction::Encrypt)),
        }
    }

    fn decrypt(&mut self, data: &mut [u8]) -> TernResult<()> {
        match &mut self.state {
            Some(CfbChain::Decrypt(dec)) => {
                for_each_block(CipherKind::Idea, data, |block| dec.decrypt_block_mut(block))
            }
            _ => Err(not_keyed(CipherKind::Idea, Direction::Decrypt)),
        }
    }
}
