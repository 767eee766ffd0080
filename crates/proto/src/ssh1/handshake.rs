//! Packet-driven SSH-1 handshake.
//!
//! The [`Handshake`] is owned by the session's reader task and fed one
//! decoded packet at a time, strictly in receipt order. It answers through
//! the session's [`PacketSender`] and reports the open session once the
//! shell or command has been started.
//!
//! # State Machine
//!
//! ```text
//! AwaitVersion -> AwaitPublicKey -> KeysSent -> UserSent
//!   -> Auth(step)*                       (skipped on immediate SUCCESS)
//!   -> CompressionRequested -> PtyRequested -> MaxPacketRequested
//!   -> X11Requested -> TunnelsRequested* -> Open
//! ```
//!
//! Setup requests are only sent when configured; the server refusing one is
//! reported and the sequence continues. Authentication walks the
//! authenticator's preference list; every method is offered at most once.
//!
//! # Security
//!
//! - The key-size guard runs before any session key exists
//! - The host key must be accepted by the [`Authenticator`] before the
//!   session key is sent
//! - Passwords, passcodes and PINs are held in `Zeroizing` buffers

use crate::ssh1::auth::{
    collect_new_pin, rhosts_rsa_request, rsa_request, rsa_response, rsa_response_packet,
    secret_packet, AuthPlan, AuthType, NewPinRequest,
};
use crate::ssh1::cipher::{CipherKind, Direction};
use crate::ssh1::codec::{check_disconnect, expect_type, PacketDecoder};
use crate::ssh1::compress::{Compressor, Decompressor};
use crate::ssh1::config::SessionConfig;
use crate::ssh1::forwarding::{port_forward_request, ForwardRule, RemoteForwards, X11Display};
use crate::ssh1::identity::{load_identity, Identity};
use crate::ssh1::kex::{
    encrypt_session_key, session_key_packet, Capabilities, ServerKeys, SessionKey,
    CLIENT_PROTOCOL_FLAGS, SESSION_ID_LEN,
};
use crate::ssh1::logging;
use crate::ssh1::message::{self, MessageType};
use crate::ssh1::packet::Packet;
use crate::ssh1::transport::PacketSender;
use crate::ssh1::version::Version;
use num_bigint::BigUint;
use rand::RngCore;
use std::collections::VecDeque;
use std::sync::Arc;
use tern_platform::{Authenticator, Console, Interactor, TernError, TernResult};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Terminates the tty-mode list of a PTY request.
pub const TTY_OP_END: u8 = 0;

/// X11 authentication protocol sent with the forwarding request.
pub const X11_AUTH_PROTOCOL: &str = "MIT-MAGIC-COOKIE-1";

/// Authentication sub-exchange in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStep {
    /// `CMSG_AUTH_PASSWORD` sent.
    Password,
    /// `CMSG_AUTH_RSA` sent, waiting for the challenge.
    PublicKey,
    /// RSA response sent.
    PublicKeyChallenge,
    /// `CMSG_AUTH_RHOSTS_RSA` sent, waiting for the challenge.
    RhostsRsa,
    /// Rhosts-RSA response sent.
    RhostsRsaChallenge,
    /// `CMSG_AUTH_RHOSTS` sent.
    Rhosts,
    /// `CMSG_AUTH_TIS` sent, waiting for the challenge.
    Tis,
    /// TIS response sent.
    TisResponse,
    /// Token passcode sent.
    Otp,
    /// Next token code sent.
    OtpNextCode,
    /// New PIN sent.
    OtpNewPin,
}

/// Handshake states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting for the server identification line.
    AwaitVersion,
    /// Waiting for `SMSG_PUBLIC_KEY`.
    AwaitPublicKey,
    /// `CMSG_SESSION_KEY` sent.
    KeysSent,
    /// `CMSG_USER` sent.
    UserSent,
    /// An authentication method is in flight.
    Auth(AuthStep),
    /// `CMSG_REQUEST_COMPRESSION` sent.
    CompressionRequested,
    /// `CMSG_REQUEST_PTY` sent.
    PtyRequested,
    /// `CMSG_MAX_PACKET_SIZE` sent.
    MaxPacketRequested,
    /// `CMSG_X11_REQUEST_FORWARDING` sent.
    X11Requested,
    /// A `CMSG_PORT_FORWARD_REQUEST` is in flight.
    TunnelsRequested,
    /// Shell or command started.
    Open,
    /// Handshake abandoned.
    Closed,
}

impl std::fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeState::Auth(step) => write!(f, "Auth({:?})", step),
            other => write!(f, "{:?}", other),
        }
    }
}

/// What the session needs once the handshake is done.
#[derive(Debug, Clone)]
pub struct OpenSession {
    /// Negotiated cipher.
    pub cipher: CipherKind,
    /// Negotiated protocol extensions.
    pub capabilities: Capabilities,
    /// Remote forwards the server accepted.
    pub remote_forwards: RemoteForwards,
    /// Local X display, if X11 forwarding was accepted.
    pub x11: Option<X11Display>,
}

/// Result of handling one packet.
#[derive(Debug, Clone)]
pub enum Progress {
    /// Handshake still running.
    Continue,
    /// The session is open.
    Open(OpenSession),
}

/// The client side of the SSH-1 handshake.
pub struct Handshake {
    config: Arc<SessionConfig>,
    authenticator: Arc<dyn Authenticator>,
    interactor: Arc<dyn Interactor>,
    console: Arc<dyn Console>,
    sender: PacketSender,
    peer: String,
    state: HandshakeState,
    server_version: Option<Version>,
    session_id: Option<[u8; SESSION_ID_LEN]>,
    cipher: Option<CipherKind>,
    capabilities: Capabilities,
    auth_mask: u32,
    plan: Option<AuthPlan>,
    identity: Option<Identity>,
    identity_tried: bool,
    pending_forwards: VecDeque<ForwardRule>,
    current_forward: Option<ForwardRule>,
    accepted_forwards: RemoteForwards,
    x11_requested: Option<X11Display>,
    x11: Option<X11Display>,
}

impl Handshake {
    /// Creates a handshake waiting for the server identification line.
    pub fn new(
        config: Arc<SessionConfig>,
        authenticator: Arc<dyn Authenticator>,
        interactor: Arc<dyn Interactor>,
        console: Arc<dyn Console>,
        sender: PacketSender,
    ) -> Self {
        let peer = config.peer();
        let pending_forwards = config.remote_forwards.iter().cloned().collect();
        Self {
            config,
            authenticator,
            interactor,
            console,
            sender,
            peer,
            state: HandshakeState::AwaitVersion,
            server_version: None,
            session_id: None,
            cipher: None,
            capabilities: Capabilities::default(),
            auth_mask: 0,
            plan: None,
            identity: None,
            identity_tried: false,
            pending_forwards,
            current_forward: None,
            accepted_forwards: RemoteForwards::new(),
            x11_requested: None,
            x11: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Server identification, once received.
    pub fn server_version(&self) -> Option<&Version> {
        self.server_version.as_ref()
    }

    /// Session id, once the server keys are known.
    pub fn session_id(&self) -> Option<&[u8; SESSION_ID_LEN]> {
        self.session_id.as_ref()
    }

    /// Marks the handshake as abandoned.
    pub fn close(&mut self) {
        self.transition(HandshakeState::Closed);
    }

    fn transition(&mut self, next: HandshakeState) {
        if self.state != next {
            logging::log_state_transition(
                &self.peer,
                &self.state.to_string(),
                &next.to_string(),
            );
            self.state = next;
        }
    }

    fn unexpected(&self, packet: &Packet) -> TernError {
        TernError::Protocol(format!(
            "Unexpected {} in state {}",
            message::describe(packet.msg_type()),
            self.state
        ))
    }

    /// Handles the server identification line and answers with ours.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Protocol`] for malformed, too old or too new
    /// versions. Nothing is sent in that case.
    pub fn start(&mut self, line: &str) -> TernResult<()> {
        if self.state != HandshakeState::AwaitVersion {
            return Err(TernError::Protocol(
                "Server identification received twice".to_string(),
            ));
        }
        let version = Version::parse(line)?;
        info!(
            "Server version {}.{} ({})",
            version.major(),
            version.effective_minor(),
            version.comment()
        );
        let ours = Version::client(&self.config.client_software);
        self.sender.send_raw(ours.to_wire_format())?;
        self.server_version = Some(version);
        self.transition(HandshakeState::AwaitPublicKey);
        Ok(())
    }

    /// Handles one packet.
    ///
    /// `decoder` is the session's inbound decoder; the handshake switches
    /// its cipher and compression at the right packet boundary.
    ///
    /// # Errors
    ///
    /// Any error is fatal for the session:
    /// - [`TernError::Disconnected`] when the server disconnects
    /// - [`TernError::Security`] for key, host-key or cipher problems
    /// - [`TernError::Authentication`] when no method is left or access is
    ///   denied
    /// - [`TernError::Protocol`] for unexpected messages
    pub async fn handle(
        &mut self,
        packet: Packet,
        decoder: &mut PacketDecoder,
    ) -> TernResult<Progress> {
        check_disconnect(&packet)?;
        match self.state {
            HandshakeState::AwaitPublicKey => {
                self.key_exchange(packet, decoder).await?;
                Ok(Progress::Continue)
            }
            HandshakeState::KeysSent => {
                expect_type(packet, MessageType::Success)?;
                let mut user = Packet::new(MessageType::User);
                user.put_string(self.authenticator.username().as_bytes());
                self.sender.send(user)?;
                self.transition(HandshakeState::UserSent);
                Ok(Progress::Continue)
            }
            HandshakeState::UserSent => match packet.message() {
                Some(MessageType::Success) => {
                    info!("Server accepted {} without authentication", self.peer);
                    self.advance_setup()
                }
                Some(MessageType::Failure) => {
                    let has_identity = self.authenticator.identity().is_some();
                    self.plan = Some(AuthPlan::new(
                        &self.authenticator.auth_preferences(),
                        self.auth_mask,
                        has_identity,
                    ));
                    self.offer_next_method().await?;
                    Ok(Progress::Continue)
                }
                _ => Err(self.unexpected(&packet)),
            },
            HandshakeState::Auth(step) => self.authenticate(step, packet).await,
            HandshakeState::CompressionRequested => {
                match packet.message() {
                    Some(MessageType::Success) => {
                        let compressor = Compressor::new(self.config.compression_level)?;
                        self.sender.activate_compression(compressor)?;
                        decoder.enable_compression(Decompressor::new(self.config.inflate_limit()));
                        debug!(level = self.config.compression_level, "Compression enabled");
                    }
                    Some(MessageType::Failure) => self.refused("compression"),
                    _ => return Err(self.unexpected(&packet)),
                }
                self.advance_setup()
            }
            HandshakeState::PtyRequested => {
                self.setup_reply(&packet, "pseudo-terminal allocation")?;
                self.advance_setup()
            }
            HandshakeState::MaxPacketRequested => {
                self.setup_reply(&packet, "maximum packet size")?;
                self.advance_setup()
            }
            HandshakeState::X11Requested => {
                if self.setup_reply(&packet, "X11 forwarding")? {
                    self.x11 = self.x11_requested.take();
                }
                self.advance_setup()
            }
            HandshakeState::TunnelsRequested => {
                let rule = self.current_forward.take();
                match packet.message() {
                    Some(MessageType::Success) => {
                        if let Some(rule) = rule {
                            logging::log_forward_open("remote", &rule.to_string());
                            self.accepted_forwards.register(rule);
                        }
                    }
                    Some(MessageType::Failure) => {
                        let shown = rule.map(|r| r.to_string()).unwrap_or_default();
                        self.interactor
                            .report(&format!("Server refused remote forward {}", shown));
                        logging::log_negotiation_refused("port forward");
                    }
                    _ => return Err(self.unexpected(&packet)),
                }
                self.advance_setup()
            }
            HandshakeState::AwaitVersion | HandshakeState::Open | HandshakeState::Closed => {
                Err(self.unexpected(&packet))
            }
        }
    }

    async fn key_exchange(&mut self, packet: Packet, decoder: &mut PacketDecoder) -> TernResult<()> {
        let packet = expect_type(packet, MessageType::PublicKey)?;
        let keys = ServerKeys::parse(&packet)?;
        keys.check_key_sizes()?;

        let host_info = keys.host_key.host_key_info(keys.host_bits);
        let trusted = self
            .authenticator
            .verify_host_key(&self.config.host, self.config.port, &host_info)
            .await?;
        if !trusted {
            return Err(TernError::Security(format!(
                "Host key for {} was not accepted",
                self.peer
            )));
        }

        let cipher = match self.config.cipher {
            Some(cipher) => cipher,
            None => CipherKind::from_id(self.authenticator.cipher_preference())?,
        };
        if !keys.supports_cipher(cipher) {
            return Err(TernError::Security(format!(
                "Server does not support the {} cipher",
                cipher.name()
            )));
        }

        let session_id = keys.session_id();
        let session_key = SessionKey::generate();
        let encrypted =
            encrypt_session_key(&session_key, &session_id, &keys.server_key, &keys.host_key)?;
        self.sender.send(session_key_packet(
            cipher,
            &keys.cookie,
            &encrypted,
            CLIENT_PROTOCOL_FLAGS,
        ))?;

        let mut outbound = cipher.create();
        outbound.set_key(Direction::Encrypt, session_key.as_bytes())?;
        self.sender.activate_cipher(outbound)?;
        let mut inbound = cipher.create();
        inbound.set_key(Direction::Decrypt, session_key.as_bytes())?;
        decoder.set_cipher(inbound);

        debug!(
            cipher = %cipher,
            server_bits = keys.server_key.bits(),
            host_bits = keys.host_key.bits(),
            "Session key sent"
        );
        self.session_id = Some(session_id);
        self.cipher = Some(cipher);
        self.capabilities = keys.capabilities();
        self.auth_mask = keys.auth_mask;
        self.transition(HandshakeState::KeysSent);
        Ok(())
    }

    /// Offers methods until one has been sent.
    async fn offer_next_method(&mut self) -> TernResult<()> {
        loop {
            let method = match self.plan.as_mut() {
                Some(plan) => plan.next(self.interactor.as_ref())?,
                None => {
                    return Err(TernError::Authentication(
                        "no more authentication methods".to_string(),
                    ))
                }
            };
            logging::log_auth_attempt(method.name());
            if self.offer(method).await? {
                return Ok(());
            }
        }
    }

    /// Sends the opening message of `method`. Returns false if the
    /// credentials for it are not available.
    async fn offer(&mut self, method: AuthType) -> TernResult<bool> {
        match method {
            AuthType::Password => {
                let prompt = format!(
                    "{}@{}'s password: ",
                    self.authenticator.username(),
                    self.config.host
                );
                let Some(password) = self.authenticator.password(&prompt).await else {
                    logging::log_auth_failed(method.name(), "no password supplied");
                    return Ok(false);
                };
                let password = Zeroizing::new(password);
                self.sender
                    .send(secret_packet(MessageType::AuthPassword, &password))?;
                self.transition(HandshakeState::Auth(AuthStep::Password));
            }
            AuthType::Rsa => {
                if !self.ensure_identity().await {
                    return Ok(false);
                }
                let Some(identity) = &self.identity else {
                    return Ok(false);
                };
                self.sender.send(rsa_request(identity.key()))?;
                self.transition(HandshakeState::Auth(AuthStep::PublicKey));
            }
            AuthType::RhostsRsa => {
                if !self.ensure_identity().await {
                    return Ok(false);
                }
                let Some(identity) = &self.identity else {
                    return Ok(false);
                };
                let packet = rhosts_rsa_request(&self.authenticator.username(), identity.key());
                self.sender.send(packet)?;
                self.transition(HandshakeState::Auth(AuthStep::RhostsRsa));
            }
            AuthType::Rhosts => {
                self.sender.send(secret_packet(
                    MessageType::AuthRhosts,
                    &self.authenticator.username(),
                ))?;
                self.transition(HandshakeState::Auth(AuthStep::Rhosts));
            }
            AuthType::Tis => {
                self.sender.send(Packet::new(MessageType::AuthTis))?;
                self.transition(HandshakeState::Auth(AuthStep::Tis));
            }
            AuthType::Sdi => {
                if !self.send_passcode().await? {
                    return Ok(false);
                }
            }
            AuthType::Kerberos | AuthType::KerberosTgt => return Ok(false),
        }
        Ok(true)
    }

    async fn send_passcode(&mut self) -> TernResult<bool> {
        let Some(code) = self.authenticator.challenge_response("Passcode: ").await else {
            logging::log_auth_failed(AuthType::Sdi.name(), "no passcode supplied");
            return Ok(false);
        };
        let code = Zeroizing::new(code);
        self.sender.send(secret_packet(MessageType::AUTH_SDI, &code))?;
        self.transition(HandshakeState::Auth(AuthStep::Otp));
        Ok(true)
    }

    async fn ensure_identity(&mut self) -> bool {
        if !self.identity_tried {
            self.identity_tried = true;
            if let Some(material) = self.authenticator.identity() {
                match load_identity(&material, self.interactor.as_ref()).await {
                    Ok(identity) => {
                        debug!(comment = %identity.comment(), "Identity loaded");
                        self.identity = Some(identity);
                    }
                    Err(e) => {
                        self.interactor
                            .report(&format!("Cannot use identity: {}", e));
                    }
                }
            }
        }
        self.identity.is_some()
    }

    fn rsa_answer(&self, packet: &Packet) -> TernResult<Packet> {
        let challenge: BigUint = packet.reader().get_mpint()?;
        let (Some(identity), Some(session_id)) = (&self.identity, &self.session_id) else {
            return Err(TernError::Protocol(
                "RSA challenge without an identity".to_string(),
            ));
        };
        let response = rsa_response(&challenge, identity.key(), session_id)?;
        Ok(rsa_response_packet(&response))
    }

    /// Method failed: log it and try the next one.
    async fn method_failed(&mut self, method: AuthType, reason: &str) -> TernResult<Progress> {
        logging::log_auth_failed(method.name(), reason);
        self.offer_next_method().await?;
        Ok(Progress::Continue)
    }

    async fn authenticate(
        &mut self,
        step: AuthStep,
        packet: Packet,
    ) -> TernResult<Progress> {
        let msg = packet.message();
        match (step, msg) {
            (AuthStep::PublicKey, Some(MessageType::AuthRsaChallenge)) => {
                let answer = self.rsa_answer(&packet)?;
                self.sender.send(answer)?;
                self.transition(HandshakeState::Auth(AuthStep::PublicKeyChallenge));
                Ok(Progress::Continue)
            }
            (AuthStep::RhostsRsa, Some(MessageType::AuthRsaChallenge)) => {
                let answer = self.rsa_answer(&packet)?;
                self.sender.send(answer)?;
                self.transition(HandshakeState::Auth(AuthStep::RhostsRsaChallenge));
                Ok(Progress::Continue)
            }
            (AuthStep::Tis, Some(MessageType::AuthTisChallenge)) => {
                let challenge = packet.reader().get_text()?;
                let Some(answer) = self.authenticator.challenge_response(&challenge).await else {
                    return self.method_failed(AuthType::Tis, "challenge not answered").await;
                };
                let answer = Zeroizing::new(answer);
                self.sender
                    .send(secret_packet(MessageType::AuthTisResponse, &answer))?;
                self.transition(HandshakeState::Auth(AuthStep::TisResponse));
                Ok(Progress::Continue)
            }
            (_, Some(MessageType::Success)) | (_, Some(MessageType::AcmOk)) => {
                info!("Authenticated to {} ({:?})", self.peer, step);
                self.plan = None;
                self.advance_setup()
            }
            (AuthStep::Otp | AuthStep::OtpNextCode | AuthStep::OtpNewPin, Some(acm)) => {
                self.token_reply(acm, &packet).await
            }
            (_, Some(MessageType::Failure)) => {
                let method = step_method(step);
                self.method_failed(method, "refused by server").await
            }
            _ => Err(self.unexpected(&packet)),
        }
    }

    async fn token_reply(&mut self, msg: MessageType, packet: &Packet) -> TernResult<Progress> {
        match msg {
            MessageType::AcmNextCodeRequired => {
                let Some(code) = self
                    .authenticator
                    .challenge_response("Wait for the token code to change, then enter the next code: ")
                    .await
                else {
                    return self.method_failed(AuthType::Sdi, "next code not supplied").await;
                };
                let code = Zeroizing::new(code);
                self.sender
                    .send(secret_packet(MessageType::AcmNextCode, &code))?;
                self.transition(HandshakeState::Auth(AuthStep::OtpNextCode));
            }
            MessageType::AcmNewPinRequired => {
                let request = NewPinRequest::parse(packet)?;
                let Some(pin) = collect_new_pin(&request, self.interactor.as_ref()).await else {
                    return self.method_failed(AuthType::Sdi, "new PIN declined").await;
                };
                self.sender.send(secret_packet(MessageType::AcmNewPin, &pin))?;
                self.transition(HandshakeState::Auth(AuthStep::OtpNewPin));
            }
            MessageType::AcmNewPinAccepted => {
                self.interactor
                    .report("New PIN accepted; enter a passcode with the new PIN");
                if !self.send_passcode().await? {
                    return self.method_failed(AuthType::Sdi, "no passcode supplied").await;
                }
            }
            MessageType::AcmNewPinRejected => {
                self.interactor.report("New PIN rejected by the server");
                return self.method_failed(AuthType::Sdi, "new PIN rejected").await;
            }
            MessageType::AcmAccessDenied => {
                logging::log_auth_failed(AuthType::Sdi.name(), "access denied");
                return Err(TernError::Authentication(
                    "Access denied by the token server".to_string(),
                ));
            }
            MessageType::Failure => {
                return self.method_failed(AuthType::Sdi, "refused by server").await;
            }
            _ => return Err(self.unexpected(packet)),
        }
        Ok(Progress::Continue)
    }

    fn refused(&self, what: &str) {
        self.interactor
            .report(&format!("Server refused {}", what));
        logging::log_negotiation_refused(what);
    }

    /// SUCCESS/FAILURE for a tolerant setup request. Returns true on
    /// success.
    fn setup_reply(&self, packet: &Packet, what: &str) -> TernResult<bool> {
        match packet.message() {
            Some(MessageType::Success) => Ok(true),
            Some(MessageType::Failure) => {
                self.refused(what);
                Ok(false)
            }
            _ => Err(self.unexpected(packet)),
        }
    }

    /// Sends the next configured setup request, or starts the shell.
    fn advance_setup(&mut self) -> TernResult<Progress> {
        let mut stage = self.state;
        loop {
            stage = match stage {
                HandshakeState::CompressionRequested => HandshakeState::PtyRequested,
                HandshakeState::PtyRequested => HandshakeState::MaxPacketRequested,
                HandshakeState::MaxPacketRequested => HandshakeState::X11Requested,
                HandshakeState::X11Requested | HandshakeState::TunnelsRequested => {
                    HandshakeState::TunnelsRequested
                }
                _ => HandshakeState::CompressionRequested,
            };
            if stage == HandshakeState::TunnelsRequested {
                if let Some(rule) = self.pending_forwards.pop_front() {
                    self.sender.send(port_forward_request(&rule))?;
                    self.current_forward = Some(rule);
                    self.transition(stage);
                    return Ok(Progress::Continue);
                }
                return self.open_session();
            }
            if self.request(stage)? {
                self.transition(stage);
                return Ok(Progress::Continue);
            }
        }
    }

    /// Sends the request for `stage` if it is configured.
    fn request(&mut self, stage: HandshakeState) -> TernResult<bool> {
        let packet = match stage {
            HandshakeState::CompressionRequested if self.config.compression_level > 0 => {
                let mut packet = Packet::new(MessageType::RequestCompression);
                packet.put_u32(self.config.compression_level);
                packet
            }
            HandshakeState::PtyRequested if self.config.request_pty => {
                let size = self.console.terminal_size();
                let mut packet = Packet::new(MessageType::RequestPty);
                packet
                    .put_string(self.console.terminal_type().as_bytes())
                    .put_u32(size.rows)
                    .put_u32(size.cols)
                    .put_u32(size.width_px)
                    .put_u32(size.height_px)
                    .put_u8(TTY_OP_END);
                packet
            }
            HandshakeState::MaxPacketRequested => match self.config.max_packet_size {
                Some(size) => {
                    let mut packet = Packet::new(MessageType::MaxPacketSize);
                    packet.put_u32(size);
                    packet
                }
                None => return Ok(false),
            },
            HandshakeState::X11Requested if self.config.x11_forwarding => {
                let display = X11Display::parse(&self.config.x11_display)?;
                let mut cookie = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut cookie);
                let mut packet = Packet::new(MessageType::X11RequestForwarding);
                packet
                    .put_string(X11_AUTH_PROTOCOL.as_bytes())
                    .put_string(hex::encode(cookie).as_bytes());
                if self.capabilities.screen_number {
                    packet.put_u32(display.screen);
                }
                self.x11_requested = Some(display);
                packet
            }
            _ => return Ok(false),
        };
        self.sender.send(packet)?;
        Ok(true)
    }

    fn open_session(&mut self) -> TernResult<Progress> {
        match &self.config.command {
            Some(command) => {
                let mut packet = Packet::new(MessageType::ExecCmd);
                packet.put_string(command.as_bytes());
                self.sender.send(packet)?;
                debug!(command = %command, "Command started");
            }
            None => {
                self.sender.send(Packet::new(MessageType::ExecShell))?;
                debug!("Shell started");
            }
        }
        let cipher = self.cipher.ok_or_else(|| {
            TernError::Protocol("Session opened without key exchange".to_string())
        })?;
        self.transition(HandshakeState::Open);
        Ok(Progress::Open(OpenSession {
            cipher,
            capabilities: self.capabilities,
            remote_forwards: std::mem::take(&mut self.accepted_forwards),
            x11: self.x11.take(),
        }))
    }
}

fn step_method(step: AuthStep) -> AuthType {
    match step {
        AuthStep::Password => AuthType::Password,
        AuthStep::PublicKey | AuthStep::PublicKeyChallenge => AuthType::Rsa,
        AuthStep::RhostsRsa | AuthStep::RhostsRsaChallenge => AuthType::RhostsRsa,
        AuthStep::Rhosts => AuthType::Rhosts,
        AuthStep::Tis | AuthStep::TisResponse => AuthType::Tis,
        AuthStep::Otp | AuthStep::OtpNextCode | AuthStep::OtpNewPin => AuthType::Sdi,
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("cipher", &self.cipher)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh1::forwarding::ForwardAddr;
    use crate::ssh1::transport::{queue, Outbound};
    use parking_lot::Mutex;
    use tern_platform::{HostKeyInfo, IdentityMaterial, TerminalSize};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Fixture {
        passwords: Mutex<Vec<String>>,
        codes: Mutex<Vec<String>>,
        reports: Mutex<Vec<String>>,
        preferences: Vec<u8>,
    }

    #[async_trait::async_trait]
    impl Authenticator for Fixture {
        fn username(&self) -> String {
            "alice".to_string()
        }
        async fn password(&self, _prompt: &str) -> Option<String> {
            self.passwords.lock().pop()
        }
        async fn challenge_response(&self, _prompt: &str) -> Option<String> {
            self.codes.lock().pop()
        }
        fn auth_preferences(&self) -> Vec<u8> {
            self.preferences.clone()
        }
        fn cipher_preference(&self) -> u8 {
            CipherKind::TripleDes.id()
        }
        fn identity(&self) -> Option<IdentityMaterial> {
            None
        }
        async fn verify_host_key(&self, _h: &str, _p: u16, _k: &HostKeyInfo) -> TernResult<bool> {
            Ok(true)
        }
    }

    #[async_trait::async_trait]
    impl Interactor for Fixture {
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

    impl Console for Fixture {
        fn terminal_type(&self) -> String {
            "vt100".to_string()
        }
        fn terminal_size(&self) -> TerminalSize {
            TerminalSize::new(24, 80)
        }
        fn write_output(&self, _data: &[u8]) {}
        fn write_error(&self, _data: &[u8]) {}
        fn session_opened(&self, _cipher: &str) {}
        fn session_closed(&self, _exit_status: Option<u32>) {}
    }

    fn handshake(
        config: SessionConfig,
        fixture: Fixture,
    ) -> (Handshake, Arc<Fixture>, mpsc::UnboundedReceiver<Outbound>) {
        let fixture = Arc::new(fixture);
        let (sender, rx) = queue();
        let hs = Handshake::new(
            Arc::new(config),
            fixture.clone(),
            fixture.clone(),
            fixture.clone(),
            sender,
        );
        (hs, fixture, rx)
    }

    fn sent(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<u8> {
        let mut types = Vec::new();
        while let Ok(command) = rx.try_recv() {
            if let Outbound::Packet(packet) = command {
                types.push(packet.msg_type());
            }
        }
        types
    }

    /// Puts the handshake in the post-kex state without running the
    /// key exchange.
    fn after_kex(hs: &mut Handshake, auth_mask: u32) {
        hs.state = HandshakeState::UserSent;
        hs.cipher = Some(CipherKind::TripleDes);
        hs.session_id = Some([7u8; SESSION_ID_LEN]);
        hs.auth_mask = auth_mask;
    }

    #[test]
    fn test_start_sends_identification() {
        let (mut hs, _, mut rx) = handshake(SessionConfig::new("h", 22), Fixture::default());
        hs.start("SSH-1.99-OpenSSH_3.9").unwrap();
        assert_eq!(hs.state(), HandshakeState::AwaitPublicKey);
        assert_eq!(hs.server_version().unwrap().effective_minor(), 5);
        match rx.try_recv().unwrap() {
            Outbound::Raw(bytes) => assert!(bytes.starts_with(b"SSH-1.5-Tern_")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_start_rejects_old_version_silently() {
        let (mut hs, _, mut rx) = handshake(SessionConfig::new("h", 22), Fixture::default());
        let err = hs.start("SSH-0.9-OpenSSH").unwrap_err();
        assert!(matches!(err, TernError::Protocol(_)));
        assert!(rx.try_recv().is_err());
        assert_eq!(hs.state(), HandshakeState::AwaitVersion);
    }

    #[tokio::test]
    async fn test_immediate_success_skips_auth_and_opens_shell() {
        let config = SessionConfig::new("h", 22).with_pty(false);
        let (mut hs, _, mut rx) = handshake(config, Fixture::default());
        after_kex(&mut hs, 0);
        let mut decoder = PacketDecoder::new();

        let progress = hs
            .handle(Packet::new(MessageType::Success), &mut decoder)
            .await
            .unwrap();
        assert!(matches!(progress, Progress::Open(_)));
        assert_eq!(hs.state(), HandshakeState::Open);
        assert_eq!(sent(&mut rx), vec![MessageType::ExecShell as u8]);
    }

    #[tokio::test]
    async fn test_password_then_setup_sequence() {
        let fixture = Fixture {
            preferences: vec![AuthType::Password as u8],
            passwords: Mutex::new(vec!["hunter2".to_string()]),
            ..Default::default()
        };
        let config = SessionConfig::new("h", 22)
            .with_max_packet_size(32768)
            .with_remote_forward(ForwardRule::new(
                ForwardAddr::new("0.0.0.0", 8022),
                ForwardAddr::new("localhost", 22),
            ))
            .with_command("uptime");
        let (mut hs, fixture, mut rx) = handshake(config, fixture);
        after_kex(&mut hs, AuthType::Password.mask_bit());
        let mut decoder = PacketDecoder::new();

        hs.handle(Packet::new(MessageType::Failure), &mut decoder)
            .await
            .unwrap();
        assert_eq!(hs.state(), HandshakeState::Auth(AuthStep::Password));

        hs.handle(Packet::new(MessageType::Success), &mut decoder)
            .await
            .unwrap();
        assert_eq!(hs.state(), HandshakeState::PtyRequested);

        // PTY refused: reported, sequence continues.
        hs.handle(Packet::new(MessageType::Failure), &mut decoder)
            .await
            .unwrap();
        assert_eq!(hs.state(), HandshakeState::MaxPacketRequested);
        assert!(fixture.reports.lock()[0].contains("pseudo-terminal"));

        hs.handle(Packet::new(MessageType::Success), &mut decoder)
            .await
            .unwrap();
        assert_eq!(hs.state(), HandshakeState::TunnelsRequested);

        let progress = hs
            .handle(Packet::new(MessageType::Success), &mut decoder)
            .await
            .unwrap();
        let Progress::Open(open) = progress else {
            panic!("session not open");
        };
        assert_eq!(open.remote_forwards.len(), 1);
        assert_eq!(
            sent(&mut rx),
            vec![
                MessageType::AuthPassword as u8,
                MessageType::RequestPty as u8,
                MessageType::MaxPacketSize as u8,
                MessageType::PortForwardRequest as u8,
                MessageType::ExecCmd as u8,
            ]
        );
    }

    #[tokio::test]
    async fn test_auth_exhaustion() {
        let fixture = Fixture {
            preferences: vec![AuthType::Password as u8, AuthType::Rsa as u8],
            passwords: Mutex::new(vec!["wrong".to_string()]),
            ..Default::default()
        };
        let (mut hs, fixture, mut rx) = handshake(SessionConfig::new("h", 22), fixture);
        after_kex(&mut hs, AuthType::Password.mask_bit() | AuthType::Rsa.mask_bit());
        let mut decoder = PacketDecoder::new();

        hs.handle(Packet::new(MessageType::Failure), &mut decoder)
            .await
            .unwrap();
        let err = hs
            .handle(Packet::new(MessageType::Failure), &mut decoder)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no more authentication methods"));
        assert_eq!(sent(&mut rx), vec![MessageType::AuthPassword as u8]);
        assert!(fixture
            .reports
            .lock()
            .iter()
            .any(|r| r.contains("no identity configured")));
    }

    #[tokio::test]
    async fn test_token_next_code_and_access_denied() {
        let fixture = Fixture {
            preferences: vec![AuthType::Sdi as u8],
            codes: Mutex::new(vec!["222222".to_string(), "111111".to_string()]),
            ..Default::default()
        };
        let (mut hs, _, mut rx) = handshake(SessionConfig::new("h", 22), fixture);
        after_kex(&mut hs, AuthType::Sdi.mask_bit());
        let mut decoder = PacketDecoder::new();

        hs.handle(Packet::new(MessageType::Failure), &mut decoder)
            .await
            .unwrap();
        assert_eq!(hs.state(), HandshakeState::Auth(AuthStep::Otp));
        hs.handle(Packet::new(MessageType::AcmNextCodeRequired), &mut decoder)
            .await
            .unwrap();
        assert_eq!(hs.state(), HandshakeState::Auth(AuthStep::OtpNextCode));

        let err = hs
            .handle(Packet::new(MessageType::AcmAccessDenied), &mut decoder)
            .await
            .unwrap_err();
        assert!(matches!(err, TernError::Authentication(_)));
        assert_eq!(
            sent(&mut rx),
            vec![MessageType::AUTH_SDI as u8, MessageType::AcmNextCode as u8]
        );
    }

    #[tokio::test]
    async fn test_disconnect_in_any_state() {
        let (mut hs, _, _rx) = handshake(SessionConfig::new("h", 22), Fixture::default());
        after_kex(&mut hs, 0);
        let mut packet = Packet::new(MessageType::Disconnect);
        packet.put_string(b"go away");
        let err = hs.handle(packet, &mut PacketDecoder::new()).await.unwrap_err();
        assert!(matches!(err, TernError::Disconnected(ref r) if r == "go away"));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(
            HandshakeState::Auth(AuthStep::OtpNewPin).to_string(),
            "Auth(OtpNewPin)"
        );
        assert_eq!(HandshakeState::KeysSent.to_string(), "KeysSent");
    }
}
