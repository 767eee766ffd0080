//! SSH-1 (protocol 1.5) client core.
//!
//! # Architecture
//!
//! The implementation is layered, leaves first:
//!
//! 1. **Wire primitives** ([`packet`], [`message`]) - typed payload writers
//!    and readers, message numbers
//! 2. **Ciphers and RSA** ([`cipher`], [`rsa`]) - DES, inner-CBC 3DES,
//!    Blowfish, IDEA-CFB and the RSA/PKCS#1 operations of the key exchange
//! 3. **Packet codec** ([`codec`], [`compress`]) - padded, CRC-checked,
//!    optionally encrypted and compressed framing
//! 4. **Key exchange and authentication** ([`kex`], [`auth`], [`identity`])
//! 5. **Handshake** ([`handshake`]) - the packet-driven state machine
//! 6. **Session** ([`transport`], [`session`], [`channel`], [`forwarding`]) -
//!    tokio tasks, channel multiplexing and port forwarding
//! 7. **Client** ([`client`]) - the public entry point
//!
//! # Security Considerations
//!
//! - **Input Validation**: packet lengths are checked against
//!   [`MAX_PACKET_SIZE`] before any allocation and the CRC is verified
//!   before a packet is interpreted
//! - **Key Sanity**: server and host keys whose sizes differ by fewer than
//!   24 bits are rejected before the session key is generated
//! - **Memory Safety**: session keys, passwords and PINs are zeroized on drop
//! - **No Unsafe Code**
//!
//! SSH-1 itself is obsolete: its CRC-based integrity check is forgeable and
//! the ciphers are weak by modern standards. Use it only to reach equipment
//! that speaks nothing else.
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh1::{MessageType, Packet, PacketDecoder, PacketEncoder, Decoded};
//!
//! let mut packet = Packet::new(MessageType::User);
//! packet.put_string(b"alice");
//!
//! let wire = PacketEncoder::new().encode(&packet).unwrap();
//!
//! let mut decoder = PacketDecoder::new();
//! decoder.feed(&wire);
//! assert_eq!(decoder.next().unwrap(), Decoded::Complete(packet));
//! ```

pub mod auth;
pub mod channel;
pub mod cipher;
pub mod client;
pub mod codec;
pub mod compress;
pub mod config;
pub mod forwarding;
pub mod handshake;
pub mod identity;
pub mod kex;
pub mod logging;
pub mod message;
pub mod packet;
pub mod rsa;
pub mod session;
pub mod transport;
pub mod version;

// Re-export main types
pub use auth::{AuthPlan, AuthType, NewPinPolicy, NewPinRequest};
pub use channel::{ChannelController, ChannelInfo, ChannelKind, ChannelState, Received};
pub use cipher::{Cipher, CipherKind, Direction};
pub use client::{Client, Collaborators};
pub use codec::{Decoded, PacketDecoder, PacketEncoder, MAX_PACKET_SIZE};
pub use compress::{Compressor, Decompressor};
pub use config::SessionConfig;
pub use forwarding::{parse_forward_rule, ForwardAddr, ForwardRule, HostMap, X11Display};
pub use handshake::{AuthStep, Handshake, HandshakeState, OpenSession, Progress};
pub use identity::Identity;
pub use kex::{Capabilities, ServerKeys, SessionKey};
pub use message::MessageType;
pub use packet::{Packet, PacketReader};
pub use rsa::{RsaPrivateKey, RsaPublicKey};
pub use session::{KeepaliveTask, SessionStatus};
pub use transport::{Outbound, PacketSender};
pub use version::Version;
