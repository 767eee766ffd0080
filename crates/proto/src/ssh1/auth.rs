//! SSH-1 user authentication.
//!
//! After `CMSG_USER` the server either accepts immediately with
//! `SMSG_SUCCESS` or the client works through its preferred methods, one at
//! a time, until one succeeds:
//!
//! - **password** - `CMSG_AUTH_PASSWORD` with the cleartext password
//! - **rsa** - `CMSG_AUTH_RSA` with the identity modulus, then an
//!   encrypted challenge answered with `MD5(challenge || session_id)`
//! - **rhosts-rsa** - like rsa, but the server checks the client host key
//! - **rhosts** - `CMSG_AUTH_RHOSTS` with the local user name
//! - **tis** - server challenge text, user response
//! - **securid** - token code, with optional next-code and new-PIN dialogs
//!
//! [`AuthPlan`] walks the preference list against the server's mask and
//! never offers a method twice.
//!
//! # Security
//!
//! - The RSA response mixes in the session id, so it cannot be replayed on
//!   another connection.
//! - Passwords and PINs are wiped from memory after sending.

use crate::ssh1::message::MessageType;
use crate::ssh1::packet::Packet;
use crate::ssh1::rsa::{to_fixed_bytes, RsaPrivateKey};
use crate::ssh1::kex::SESSION_ID_LEN;
use md5::{Digest, Md5};
use num_bigint::BigUint;
use tern_platform::{Interactor, TernError, TernResult};
use tracing::debug;
use zeroize::Zeroizing;

/// Length of the decrypted RSA challenge.
pub const CHALLENGE_LEN: usize = 32;

/// How many times the user may retype a mismatched or invalid PIN.
pub const MAX_PIN_ATTEMPTS: usize = 3;

/// SSH-1 authentication types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum AuthType {
    /// `.rhosts` / `hosts.equiv` trust
    Rhosts = 1,
    /// RSA identity challenge/response
    Rsa = 2,
    /// Cleartext password
    Password = 3,
    /// Rhosts plus RSA host authentication
    RhostsRsa = 4,
    /// TIS challenge/response
    Tis = 5,
    /// Kerberos ticket
    Kerberos = 6,
    /// Kerberos TGT passing
    KerberosTgt = 7,
    /// SecurID token (ACM)
    Sdi = 16,
}

impl AuthType {
    /// Converts a wire id.
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(AuthType::Rhosts),
            2 => Some(AuthType::Rsa),
            3 => Some(AuthType::Password),
            4 => Some(AuthType::RhostsRsa),
            5 => Some(AuthType::Tis),
            6 => Some(AuthType::Kerberos),
            7 => Some(AuthType::KerberosTgt),
            16 => Some(AuthType::Sdi),
            _ => None,
        }
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            AuthType::Rhosts => "rhosts",
            AuthType::Rsa => "rsa",
            AuthType::Password => "password",
            AuthType::RhostsRsa => "rhostsrsa",
            AuthType::Tis => "tis",
            AuthType::Kerberos => "kerberos",
            AuthType::KerberosTgt => "kerberos-tgt",
            AuthType::Sdi => "securid",
        }
    }

    /// Bit in the server's supported-authentications mask.
    pub fn mask_bit(self) -> u32 {
        1 << (self as u8)
    }

    /// Whether this client can carry out the method at all.
    pub fn client_supported(self) -> bool {
        !matches!(self, AuthType::Kerberos | AuthType::KerberosTgt)
    }

    /// Whether the method needs an identity key.
    pub fn needs_identity(self) -> bool {
        matches!(self, AuthType::Rsa | AuthType::RhostsRsa)
    }
}

impl std::fmt::Display for AuthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Display name for a raw auth id, known or not.
pub fn display_name(id: u8) -> String {
    match AuthType::from_id(id) {
        Some(kind) => kind.name().to_string(),
        None => format!("unknown({})", id),
    }
}

/// Iterates the client's preferences against what the server offers.
///
/// Every method is offered at most once. Skipped methods are reported
/// through the [`Interactor`] with the reason.
#[derive(Debug, Clone)]
pub struct AuthPlan {
    pending: Vec<u8>,
    tried: Vec<AuthType>,
    server_mask: u32,
    has_identity: bool,
}

impl AuthPlan {
    /// Creates a plan from preference ids and the server's auth mask.
    pub fn new(preferences: &[u8], server_mask: u32, has_identity: bool) -> Self {
        let mut pending = Vec::with_capacity(preferences.len());
        for &id in preferences {
            if !pending.contains(&id) {
                pending.push(id);
            }
        }
        Self {
            pending,
            tried: Vec::new(),
            server_mask,
            has_identity,
        }
    }

    /// Methods already offered, in order.
    pub fn tried(&self) -> &[AuthType] {
        &self.tried
    }

    /// Picks the next method to try.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Authentication`] with "no more authentication
    /// methods" once the list is exhausted.
    pub fn next(&mut self, interactor: &dyn Interactor) -> TernResult<AuthType> {
        while !self.pending.is_empty() {
            let id = self.pending.remove(0);
            let Some(kind) = AuthType::from_id(id) else {
                interactor.report(&format!(
                    "Skipping authentication method {}: not known to this client",
                    display_name(id)
                ));
                continue;
            };
            if self.tried.contains(&kind) {
                continue;
            }
            if self.server_mask & kind.mask_bit() == 0 {
                interactor.report(&format!(
                    "Skipping authentication method {}: not supported by the server",
                    kind
                ));
                continue;
            }
            if !kind.client_supported() {
                interactor.report(&format!(
                    "Skipping authentication method {}: not supported by this client",
                    kind
                ));
                continue;
            }
            if kind.needs_identity() && !self.has_identity {
                interactor.report(&format!(
                    "Skipping authentication method {}: no identity configured",
                    kind
                ));
                continue;
            }
            debug!(method = %kind, "Selected authentication method");
            self.tried.push(kind);
            return Ok(kind);
        }
        Err(TernError::Authentication(
            "no more authentication methods".to_string(),
        ))
    }
}

/// Answers an RSA challenge.
///
/// The challenge is decrypted with the identity key, stripped of its
/// PKCS#1 type 2 padding, left-padded to 32 bytes and hashed together with
/// the session id.
///
/// # Errors
///
/// Returns [`TernError::Security`] if the challenge does not decrypt to a
/// valid block of at most 32 bytes.
pub fn rsa_response(
    challenge: &BigUint,
    key: &RsaPrivateKey,
    session_id: &[u8; SESSION_ID_LEN],
) -> TernResult<[u8; 16]> {
    let plain = Zeroizing::new(key.decrypt_pkcs1(challenge)?);
    if plain.len() > CHALLENGE_LEN {
        return Err(TernError::Security(format!(
            "RSA challenge decrypts to {} bytes, expected at most {}",
            plain.len(),
            CHALLENGE_LEN
        )));
    }
    let padded = Zeroizing::new(to_fixed_bytes(&BigUint::from_bytes_be(&plain), CHALLENGE_LEN));

    let mut hasher = Md5::new();
    hasher.update(&padded[..]);
    hasher.update(session_id);
    Ok(hasher.finalize().into())
}

/// Builds a packet carrying one secret string (password, passcode, PIN).
pub fn secret_packet(msg_type: MessageType, secret: &str) -> Packet {
    let mut packet = Packet::new(msg_type);
    packet.put_string(secret.as_bytes());
    packet
}

/// Builds `CMSG_AUTH_RSA` for an identity.
pub fn rsa_request(key: &RsaPrivateKey) -> Packet {
    let mut packet = Packet::new(MessageType::AuthRsa);
    packet.put_mpint(key.public_key().modulus());
    packet
}

/// Builds `CMSG_AUTH_RHOSTS_RSA` for a host identity.
pub fn rhosts_rsa_request(local_user: &str, key: &RsaPrivateKey) -> Packet {
    let public = key.public_key();
    let mut packet = Packet::new(MessageType::AuthRhostsRsa);
    packet
        .put_string(local_user.as_bytes())
        .put_u32(public.bits() as u32)
        .put_mpint(public.exponent())
        .put_mpint(public.modulus());
    packet
}

/// Builds `CMSG_AUTH_RSA_RESPONSE`.
pub fn rsa_response_packet(response: &[u8; 16]) -> Packet {
    let mut packet = Packet::new(MessageType::AuthRsaResponse);
    packet.put_raw(response);
    packet
}

/// Server policy for a new token PIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewPinPolicy {
    /// The server assigns the PIN; the user only acknowledges it.
    CannotChoose = 0,
    /// The user may pick a PIN or accept the server's suggestion.
    UserSelectable = 1,
    /// The user has to pick a PIN.
    MustChoose = 2,
}

impl NewPinPolicy {
    fn from_u8(value: u8) -> TernResult<Self> {
        match value {
            0 => Ok(NewPinPolicy::CannotChoose),
            1 => Ok(NewPinPolicy::UserSelectable),
            2 => Ok(NewPinPolicy::MustChoose),
            other => Err(TernError::Protocol(format!(
                "Unknown new PIN policy {}",
                other
            ))),
        }
    }
}

/// Contents of `ACM_NEW_PIN_REQUIRED`.
///
/// ```text
/// byte      policy
/// uint32    minimum PIN length
/// uint32    maximum PIN length
/// string    server PIN (required for cannot-choose, optional otherwise)
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct NewPinRequest {
    /// Who picks the PIN.
    pub policy: NewPinPolicy,
    /// Minimum length.
    pub min_len: usize,
    /// Maximum length.
    pub max_len: usize,
    /// PIN proposed or assigned by the server.
    pub server_pin: Option<Zeroizing<String>>,
}

impl NewPinRequest {
    /// Parses the payload of `ACM_NEW_PIN_REQUIRED`.
    pub fn parse(packet: &Packet) -> TernResult<Self> {
        let mut reader = packet.reader();
        let policy = NewPinPolicy::from_u8(reader.get_u8()?)?;
        let min_len = reader.get_u32()? as usize;
        let max_len = reader.get_u32()? as usize;
        let server_pin = if reader.remaining() > 0 {
            Some(Zeroizing::new(reader.get_text()?))
        } else {
            None
        };
        if policy == NewPinPolicy::CannotChoose && server_pin.is_none() {
            return Err(TernError::Protocol(
                "Server-assigned PIN missing from new PIN request".to_string(),
            ));
        }
        if min_len > max_len {
            return Err(TernError::Protocol(format!(
                "New PIN length range {}-{} is empty",
                min_len, max_len
            )));
        }
        Ok(Self {
            policy,
            min_len,
            max_len,
            server_pin,
        })
    }

    /// Builds the packet (server side, used in tests).
    pub fn to_packet(&self) -> Packet {
        let mut packet = Packet::new(MessageType::AcmNewPinRequired);
        packet
            .put_u8(self.policy as u8)
            .put_u32(self.min_len as u32)
            .put_u32(self.max_len as u32);
        if let Some(pin) = &self.server_pin {
            packet.put_string(pin.as_bytes());
        }
        packet
    }
}

impl std::fmt::Debug for NewPinRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewPinRequest")
            .field("policy", &self.policy)
            .field("min_len", &self.min_len)
            .field("max_len", &self.max_len)
            .field("server_pin", &self.server_pin.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Runs the new-PIN dialog.
///
/// Returns the PIN to send, or `None` if the user declined or gave up
/// after [`MAX_PIN_ATTEMPTS`] bad entries.
pub async fn collect_new_pin(
    request: &NewPinRequest,
    interactor: &dyn Interactor,
) -> Option<Zeroizing<String>> {
    match request.policy {
        NewPinPolicy::CannotChoose => {
            let pin = request.server_pin.as_ref()?;
            interactor.alert(&format!("Your new PIN is: {}", pin.as_str()));
            if interactor
                .ask_confirmation("Accept the server-assigned PIN?", true)
                .await
            {
                Some(pin.clone())
            } else {
                None
            }
        }
        NewPinPolicy::UserSelectable => {
            if let Some(pin) = &request.server_pin {
                let accept = interactor
                    .ask_confirmation(
                        &format!("Accept the PIN {} suggested by the server?", pin.as_str()),
                        false,
                    )
                    .await;
                if accept {
                    return Some(pin.clone());
                }
            }
            enter_pin_twice(request, interactor).await
        }
        NewPinPolicy::MustChoose => enter_pin_twice(request, interactor).await,
    }
}

async fn enter_pin_twice(
    request: &NewPinRequest,
    interactor: &dyn Interactor,
) -> Option<Zeroizing<String>> {
    let prompt = format!(
        "Enter new PIN ({}-{} characters): ",
        request.min_len, request.max_len
    );
    for _ in 0..MAX_PIN_ATTEMPTS {
        let first = Zeroizing::new(interactor.prompt_line(&prompt, false).await?);
        let len = first.chars().count();
        if len < request.min_len || len > request.max_len {
            interactor.alert(&format!(
                "PIN must be {}-{} characters long",
                request.min_len, request.max_len
            ));
            continue;
        }
        let second = Zeroizing::new(interactor.prompt_line("Re-enter new PIN: ", false).await?);
        if *first != *second {
            interactor.alert("PINs do not match");
            continue;
        }
        return Some(first);
    }
    None
}
