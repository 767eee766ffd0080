//! Session configuration.
//!
//! A typed replacement for string-keyed connection properties. Build it
//! once, validate it, and hand it to [`Session`](crate::ssh1::session::Session).
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use tern_proto::ssh1::config::SessionConfig;
//!
//! let config = SessionConfig::new("bastion.example.org", 22)
//!     .with_compression_level(6)
//!     .with_keepalive(Some(Duration::from_secs(30)));
//! assert!(config.validate().is_ok());
//! ```

use crate::ssh1::cipher::CipherKind;
use crate::ssh1::codec::MAX_PACKET_SIZE;
use crate::ssh1::compress::MAX_LEVEL;
use crate::ssh1::forwarding::{ForwardRule, X11Display};
use std::time::Duration;
use tern_platform::{TernError, TernResult};

/// Smallest maximum packet size the server accepts.
pub const MIN_MAX_PACKET: u32 = 4096;

/// Largest maximum packet size the server accepts.
pub const MAX_MAX_PACKET: u32 = 1024 * 1024;

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// Connection settings for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Time allowed for the server's identification line.
    pub hello_timeout: Duration,
    /// Time allowed from identification to open session.
    pub kex_timeout: Duration,
    /// Overrides the authenticator's cipher preference.
    pub cipher: Option<CipherKind>,
    /// zlib level, 0 disables compression.
    pub compression_level: u32,
    /// Whether to request a pseudo-terminal.
    pub request_pty: bool,
    /// Maximum packet size to request, if any.
    pub max_packet_size: Option<u32>,
    /// Whether to request X11 forwarding.
    pub x11_forwarding: bool,
    /// Local X display for forwarded X11 connections.
    pub x11_display: String,
    /// Local forwards.
    pub local_forwards: Vec<ForwardRule>,
    /// Remote forwards.
    pub remote_forwards: Vec<ForwardRule>,
    /// Remote command; `None` starts an interactive shell.
    pub command: Option<String>,
    /// Keep-alive interval; `None` disables it.
    pub keepalive: Option<Duration>,
    /// Software field of the client identification line.
    pub client_software: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(30),
            hello_timeout: Duration::from_secs(10),
            kex_timeout: Duration::from_secs(60),
            cipher: None,
            compression_level: 0,
            request_pty: true,
            max_packet_size: None,
            x11_forwarding: false,
            x11_display: ":0".to_string(),
            local_forwards: Vec::new(),
            remote_forwards: Vec::new(),
            command: None,
            keepalive: None,
            client_software: format!("Tern_{}", tern_platform::VERSION),
        }
    }
}

impl SessionConfig {
    /// Creates a configuration for `host:port` with default values.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the identification timeout.
    pub fn with_hello_timeout(mut self, timeout: Duration) -> Self {
        self.hello_timeout = timeout;
        self
    }

    /// Sets the key exchange timeout.
    pub fn with_kex_timeout(mut self, timeout: Duration) -> Self {
        self.kex_timeout = timeout;
        self
    }

    /// Forces a cipher.
    pub fn with_cipher(mut self, cipher: CipherKind) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Sets the compression level (0 disables).
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level;
        self
    }

    /// Enables or disables the PTY request.
    pub fn with_pty(mut self, request_pty: bool) -> Self {
        self.request_pty = request_pty;
        self
    }

    /// Requests a maximum packet size.
    pub fn with_max_packet_size(mut self, size: u32) -> Self {
        self.max_packet_size = Some(size);
        self
    }

    /// Enables X11 forwarding to `display`.
    pub fn with_x11(mut self, display: impl Into<String>) -> Self {
        self.x11_forwarding = true;
        self.x11_display = display.into();
        self
    }

    /// Adds a local forward.
    pub fn with_local_forward(mut self, rule: ForwardRule) -> Self {
        self.local_forwards.push(rule);
        self
    }

    /// Adds a remote forward.
    pub fn with_remote_forward(mut self, rule: ForwardRule) -> Self {
        self.remote_forwards.push(rule);
        self
    }

    /// Runs `command` instead of a shell.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Sets the keep-alive interval.
    pub fn with_keepalive(mut self, interval: Option<Duration>) -> Self {
        self.keepalive = interval;
        self
    }

    /// Sets the client software string.
    pub fn with_client_software(mut self, software: impl Into<String>) -> Self {
        self.client_software = software.into();
        self
    }

    /// `host:port` for logging and host-key checks.
    pub fn peer(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Config`] naming the first bad field.
    pub fn validate(&self) -> TernResult<()> {
        if self.host.is_empty() {
            return Err(TernError::Config("Host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(TernError::Config("Port must not be 0".to_string()));
        }
        if self.compression_level > MAX_LEVEL {
            return Err(TernError::Config(format!(
                "Compression level {} out of range (0-{})",
                self.compression_level, MAX_LEVEL
            )));
        }
        if let Some(size) = self.max_packet_size {
            if !(MIN_MAX_PACKET..=MAX_MAX_PACKET).contains(&size) {
                return Err(TernError::Config(format!(
                    "Maximum packet size {} out of range ({}-{})",
                    size, MIN_MAX_PACKET, MAX_MAX_PACKET
                )));
            }
        }
        if self.hello_timeout.is_zero() || self.kex_timeout.is_zero() {
            return Err(TernError::Config("Timeouts must be non-zero".to_string()));
        }
        if matches!(self.keepalive, Some(interval) if interval.is_zero()) {
            return Err(TernError::Config(
                "Keep-alive interval must be non-zero".to_string(),
            ));
        }
        if self.x11_forwarding {
            X11Display::parse(&self.x11_display)?;
        }
        if self.client_software.contains(char::is_whitespace) {
            return Err(TernError::Config(
                "Client software string must not contain whitespace".to_string(),
            ));
        }
        Ok(())
    }

    /// Decompression ceiling for inbound packets.
    pub(crate) fn inflate_limit(&self) -> usize {
        MAX_PACKET_SIZE * 4
    }
}
