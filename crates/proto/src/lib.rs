//! SSH-1 protocol client core for the Tern project.
//!
//! This crate implements the client side of SSH protocol 1.5:
//!
//! - **Packet codec** - framing, padding, CRC-32, encryption, zlib
//! - **Ciphers** - DES, 3DES (inner CBC), Blowfish, IDEA
//! - **Key exchange** - double RSA session-key encryption with PKCS#1
//! - **Authentication** - password, RSA, rhosts, rhosts-RSA, TIS, SecurID
//! - **Session** - PTY, X11 and port-forward negotiation, channel
//!   multiplexing, keep-alive
//!
//! # Features
//!
//! - `ssh1` (default) - the SSH-1 client core
//! - `serde` - serialization for configuration types
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh1::codec::crc32;
//!
//! // SSH-1 uses the reflected CRC-32 without final xor
//! assert_eq!(crc32(b"123456789"), 0x2dfd2d88);
//! ```
//!
//! # Security
//!
//! - Cryptographic primitives come from the RustCrypto crates
//! - Session keys and credentials are zeroized with `zeroize`
//! - Lengths are bounded before allocation; the decoder is fuzz tested
//!
//! # References
//!
//! - The SSH (Secure Shell) Remote Login Protocol, draft-ylonen-ssh-protocol-00
//!   (protocol version 1.5)

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh1")]
pub mod ssh1;
