//! Scripted SSH-1 server and recording collaborators for session tests.

#![allow(dead_code)]

use num_bigint::BigUint;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tern_platform::{
    Authenticator, Console, HostKeyInfo, IdentityMaterial, Interactor, TerminalSize, TernResult,
};
use tern_proto::ssh1::cipher::{CipherKind, Direction};
use tern_proto::ssh1::codec::{Decoded, PacketDecoder, PacketEncoder, MAX_PACKET_SIZE};
use tern_proto::ssh1::compress::{Compressor, Decompressor};
use tern_proto::ssh1::kex::{decrypt_session_key, ServerKeys, FLAG_HOST_IN_FWD_OPEN};
use tern_proto::ssh1::message::MessageType;
use tern_proto::ssh1::packet::Packet;
use tern_proto::ssh1::rsa::RsaPrivateKey;
use tern_proto::ssh1::client::Collaborators;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

fn big(hex_str: &str) -> BigUint {
    BigUint::parse_bytes(hex_str.as_bytes(), 16).unwrap()
}

fn key(n: &str, d: &str, p: &str, q: &str, qinv: &str) -> RsaPrivateKey {
    RsaPrivateKey::from_components(
        big(n),
        BigUint::from(0x10001u32),
        big(d),
        big(p),
        big(q),
        big(qinv),
    )
    .unwrap()
}

/// 512-bit short-lived server key.
pub fn server_key() -> RsaPrivateKey {
    key(
        "cf8fd481fd71ffa08d0e549c22084da074a0027ca3e3902224c484e5e8c008f859d3e6fcf8e98db792e8465a5d638cfc99a0003ad6b01d059eb87e36446dd4e3",
        "6206545f5bb9c5f72606d990af45ea9b57d8e5b3c596c85047bb03e4acaa5cd14b63e0a60a9302359158b4b6fc57868eb8a9285c354a7183e4b58226ab2f80f9",
        "f235bfb76a1a771eacb22aebdd4da4c95145553eb0c792105936e709393ced5d",
        "db61143954cd9391c3d372d19ac9f21b6b28fdc48b4a64587b618ebce8bb673f",
        "aa1756c367be2652eadb0d2a3b1508506b7421ed09fa3e59b89be4b4e89f9b2c",
    )
}

/// 768-bit host key.
pub fn host_key() -> RsaPrivateKey {
    key(
        "bfc0eea366462a9aa00490f391a12cbd4999fbb5b41f98c35c6866fd425dd31be0cb059f424f968830eebe9e7033520f9102972402d9ed9aefe06d0d20e7c2b9f83ba40895483dc71f264bf7787dc1b79b1f6ff572da87b61f0c295307bcee55",
        "50c65e0058f9dfc288fbc36fc6fde511cbaa60dcf706845c6f55cf648a0b69fd89611c7a2cfdc7c49110511dfed7af8e00c57e8ddcd3aa4c3ba262cda72d7e0572fd0ff1c7796df4b3b1e27eb746cc1eed94a84354eadb0086f1ff2899777681",
        "fd7986ac0cecfe627cc46c8b209651f1135b10d7e383163f74d6c7d02846b7894855797eeaec7f5d62805e1a3fae86e1",
        "c1a9fd61a570af29dac441b71ba293db166d6ebfae2b96e108530049297555090555d699de661e6c0fdbf5429625f9f5",
        "e440fb63a13211a12ac07b4ae94e9f4c94fc23eb7e5de8df26652abc8fd9953c70d2f137978ff54df10c1bd5a6b34180",
    )
}

/// 522-bit key, only 10 bits larger than [`server_key`].
pub fn near_host_key() -> RsaPrivateKey {
    key(
        "35859286438f94d9a4cced5f2362f2bb6e028c4ea17c18df1ab263922b4f49c80c92a20e77b35aa2c43d02bd198c5e4af5629081be15d69bb7b461ca723b41371ab",
        "316d507ab3ebe64ff494d7e6137ceea34f1e054b1c70c95b488153d90a2c27fc16d6dda19ba78a57d84999accc91538a1278fa6520a3fcddbdf82e301e4bffb5cd9",
        "1e71dd579d06d41628accebfd441a1bc1c1333fcdd1ca264807eae70b5c5fe3ccd",
        "1c20bf01933ab7cab6b6ba5d485f408431a4b743378fa6b77a043d782841dfe857",
        "18ab90f5404ff66df3c10ccdf61ea8550fb888f8e8845377f9c13460bb864f9f34",
    )
}

/// 512-bit user identity key.
pub fn client_key() -> RsaPrivateKey {
    key(
        "b111aed07710a140bedbf8b53398624134b8eb969adb22ad5830dba27dee6fa3986150825b5c2125703fa918866f1e69656456a74c9b684a10ebe52ca5c1f201",
        "6bf8565a735fc6940e4d5f984e3fcb19eba61eb194f7ae6b78ed41e0115e04dffe594eb5d42d9a3e0d6b7b7337c6f2c1d6595b03eff654f27d8d2b2490848b89",
        "e3da7242ca17fdfb7db052ef86185aba5733d58599bb7d01c94e5939054adb53",
        "c6f140eee57565c03c870de868452b7ba55a46b3296fd1ce755b67e319ee26db",
        "eb6d4ad6468c35296e2c20d7d599399125fde31560bd1f911243c4d97130d9d",
    )
}

/// What the fake server offers in `SMSG_PUBLIC_KEY`.
#[derive(Clone)]
pub struct Offer {
    pub server_key: RsaPrivateKey,
    pub host_key: RsaPrivateKey,
    pub protocol_flags: u32,
    pub cipher_mask: u32,
    pub auth_mask: u32,
}

impl Offer {
    pub fn new(auth_types: &[u8]) -> Self {
        Self {
            server_key: server_key(),
            host_key: host_key(),
            protocol_flags: FLAG_HOST_IN_FWD_OPEN,
            cipher_mask: CipherKind::TripleDes.mask_bit() | CipherKind::Blowfish.mask_bit(),
            auth_mask: auth_types.iter().fold(0, |mask, id| mask | (1u32 << id)),
        }
    }

    pub fn keys(&self) -> ServerKeys {
        let server = self.server_key.public_key().clone();
        let host = self.host_key.public_key().clone();
        ServerKeys {
            cookie: *b"fakesrv!",
            server_bits: server.bits() as u32,
            server_key: server,
            host_bits: host.bits() as u32,
            host_key: host,
            protocol_flags: self.protocol_flags,
            cipher_mask: self.cipher_mask,
            auth_mask: self.auth_mask,
        }
    }
}

/// Server end of a duplex connection.
pub struct FakeServer {
    stream: DuplexStream,
    decoder: PacketDecoder,
    encoder: PacketEncoder,
    pub session_id: [u8; 16],
    pub cipher: Option<CipherKind>,
}

impl FakeServer {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            decoder: PacketDecoder::new(),
            encoder: PacketEncoder::new(),
            session_id: [0u8; 16],
            cipher: None,
        }
    }

    pub async fn send_line(&mut self, line: &str) {
        self.stream.write_all(line.as_bytes()).await.unwrap();
    }

    /// Reads the client identification line byte by byte.
    pub async fn read_line(&mut self) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.stream.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                return String::from_utf8(line).unwrap();
            }
            line.push(byte[0]);
        }
    }

    pub async fn send(&mut self, packet: &Packet) {
        let wire = self.encoder.encode(packet).unwrap();
        self.stream.write_all(&wire).await.unwrap();
    }

    pub async fn send_empty(&mut self, msg_type: MessageType) {
        self.send(&Packet::new(msg_type)).await;
    }

    pub async fn recv(&mut self) -> Packet {
        let mut buf = [0u8; 4096];
        loop {
            if let Decoded::Complete(packet) = self.decoder.next().unwrap() {
                return packet;
            }
            let n = self.stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed the connection");
            self.decoder.feed(&buf[..n]);
        }
    }

    pub async fn expect(&mut self, msg_type: MessageType) -> Packet {
        let packet = self.recv().await;
        assert_eq!(
            packet.message(),
            Some(msg_type),
            "expected {}, got {}",
            msg_type,
            packet
        );
        packet
    }

    /// Reads until the client closes and returns the types of any packets
    /// that arrived meanwhile.
    pub async fn drain(&mut self) -> Vec<u8> {
        let mut rest = Vec::new();
        let _ = self.stream.read_to_end(&mut rest).await;
        self.decoder.feed(&rest);
        let mut types = Vec::new();
        while let Ok(Decoded::Complete(packet)) = self.decoder.next() {
            types.push(packet.msg_type());
        }
        types
    }

    /// Identification exchange. Returns the client's line.
    pub async fn hello(&mut self) -> String {
        self.send_line("SSH-1.5-FakeServer_1.0\r\n").await;
        self.read_line().await
    }

    /// Key exchange up to and including the SUCCESS for the session key.
    pub async fn key_exchange(&mut self, offer: &Offer) -> CipherKind {
        let keys = offer.keys();
        self.send(&keys.to_packet()).await;

        let packet = self.expect(MessageType::SessionKey).await;
        let mut reader = packet.reader();
        let cipher = CipherKind::from_id(reader.get_u8().unwrap()).unwrap();
        assert_eq!(reader.get_raw(8).unwrap(), &keys.cookie);
        let encrypted = reader.get_mpint().unwrap();
        let _flags = reader.get_u32().unwrap();

        self.session_id = keys.session_id();
        let session_key = decrypt_session_key(
            &encrypted,
            &self.session_id,
            &offer.server_key,
            &offer.host_key,
        )
        .unwrap();

        let mut inbound = cipher.create();
        inbound.set_key(Direction::Decrypt, session_key.as_bytes()).unwrap();
        self.decoder.set_cipher(inbound);
        let mut outbound = cipher.create();
        outbound.set_key(Direction::Encrypt, session_key.as_bytes()).unwrap();
        self.encoder.set_cipher(outbound);

        self.cipher = Some(cipher);
        self.send_empty(MessageType::Success).await;
        cipher
    }

    /// Reads `CMSG_USER` and returns the login name.
    pub async fn expect_user(&mut self) -> String {
        let packet = self.expect(MessageType::User).await;
        let user = packet.reader().get_text().unwrap();
        user
    }

    pub fn enable_compression(&mut self, level: u32) {
        self.encoder
            .enable_compression(Compressor::new(level).unwrap());
        self.decoder
            .enable_compression(Decompressor::new(MAX_PACKET_SIZE * 4));
    }
}

#[derive(Default)]
pub struct TestAuthenticator {
    pub passwords: Mutex<VecDeque<String>>,
    pub preferences: Vec<u8>,
    pub cipher: u8,
    pub identity: Option<IdentityMaterial>,
    pub reject_host: bool,
    pub host_checks: Mutex<Vec<HostKeyInfo>>,
    pub password_prompts: Mutex<Vec<String>>,
}

impl TestAuthenticator {
    pub fn with_passwords(preferences: Vec<u8>, passwords: &[&str]) -> Self {
        Self {
            passwords: Mutex::new(passwords.iter().map(|p| p.to_string()).collect()),
            preferences,
            cipher: CipherKind::TripleDes.id(),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl Authenticator for TestAuthenticator {
    fn username(&self) -> String {
        "alice".to_string()
    }

    async fn password(&self, prompt: &str) -> Option<String> {
        self.password_prompts.lock().push(prompt.to_string());
        self.passwords.lock().pop_front()
    }

    async fn challenge_response(&self, _prompt: &str) -> Option<String> {
        None
    }

    fn auth_preferences(&self) -> Vec<u8> {
        self.preferences.clone()
    }

    fn cipher_preference(&self) -> u8 {
        self.cipher
    }

    fn identity(&self) -> Option<IdentityMaterial> {
        self.identity.clone()
    }

    async fn verify_host_key(&self, _host: &str, _port: u16, key: &HostKeyInfo) -> TernResult<bool> {
        self.host_checks.lock().push(key.clone());
        Ok(!self.reject_host)
    }
}

#[derive(Default)]
pub struct TestInteractor {
    pub reports: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl Interactor for TestInteractor {
    fn report(&self, message: &str) {
        self.reports.lock().push(message.to_string());
    }

    fn alert(&self, message: &str) {
        self.reports.lock().push(message.to_string());
    }

    async fn prompt_line(&self, _prompt: &str, _echo: bool) -> Option<String> {
        None
    }

    async fn ask_confirmation(&self, _question: &str, default: bool) -> bool {
        default
    }
}

#[derive(Default)]
pub struct TestConsole {
    pub output: Mutex<Vec<u8>>,
    pub errors: Mutex<Vec<u8>>,
    pub opened: Mutex<Option<String>>,
    pub closed: Mutex<Vec<Option<u32>>>,
}

impl Console for TestConsole {
    fn terminal_type(&self) -> String {
        "xterm".to_string()
    }

    fn terminal_size(&self) -> TerminalSize {
        TerminalSize::new(24, 80)
    }

    fn write_output(&self, data: &[u8]) {
        self.output.lock().extend_from_slice(data);
    }

    fn write_error(&self, data: &[u8]) {
        self.errors.lock().extend_from_slice(data);
    }

    fn session_opened(&self, cipher: &str) {
        *self.opened.lock() = Some(cipher.to_string());
    }

    fn session_closed(&self, exit_status: Option<u32>) {
        self.closed.lock().push(exit_status);
    }
}

/// Collaborators plus typed handles for assertions.
pub struct Harness {
    pub authenticator: Arc<TestAuthenticator>,
    pub interactor: Arc<TestInteractor>,
    pub console: Arc<TestConsole>,
}

impl Harness {
    pub fn new(authenticator: TestAuthenticator) -> Self {
        Self {
            authenticator: Arc::new(authenticator),
            interactor: Arc::new(TestInteractor::default()),
            console: Arc::new(TestConsole::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            authenticator: self.authenticator.clone(),
            interactor: self.interactor.clone(),
            console: self.console.clone(),
        }
    }

    pub fn reported(&self, needle: &str) -> bool {
        self.interactor
            .reports
            .lock()
            .iter()
            .any(|report| report.contains(needle))
    }
}

/// Installs a test subscriber once; `RUST_LOG` controls the output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
