//! Collaborator traits for the SSH-1 client core
//!
//! The protocol core never talks to a user or a terminal directly. Everything
//! user-facing goes through these three seams:
//!
//! - [`Interactor`] - status reports, alerts, line/password prompts, yes/no
//! - [`Authenticator`] - credentials, preferences and host-key trust
//! - [`Console`] - terminal type/size and the interactive output sink

use crate::TernResult;

/// User-facing interaction.
///
/// All handshake-level user interaction goes through a single `Interactor`.
#[async_trait::async_trait]
pub trait Interactor: Send + Sync {
    /// Reports a status line (non-fatal negotiation failures, progress).
    fn report(&self, message: &str);

    /// Raises an alert the user should notice.
    fn alert(&self, message: &str);

    /// Prompts for a line of input.
    ///
    /// `echo` is false for secrets. Returns `None` if the user cancelled.
    async fn prompt_line(&self, prompt: &str, echo: bool) -> Option<String>;

    /// Asks a yes/no question.
    async fn ask_confirmation(&self, question: &str, default: bool) -> bool;
}

/// Server-side RSA key as announced in the key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HostKeyInfo {
    /// Declared modulus size in bits
    pub bits: u32,
    /// Public exponent, big-endian
    pub exponent: Vec<u8>,
    /// Modulus, big-endian
    pub modulus: Vec<u8>,
}

/// Private key file contents handed to the core for RSA authentication.
#[derive(Clone)]
pub struct IdentityMaterial {
    /// Raw identity file bytes
    pub file: Vec<u8>,
    /// Passphrase, if already known. `None` means prompt when needed.
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for IdentityMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMaterial")
            .field("file", &format!("<{} bytes>", self.file.len()))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Credential and preference provider.
///
/// Not owned by the session; the session only holds a shared reference.
#[async_trait::async_trait]
pub trait Authenticator: Send + Sync {
    /// Login name sent with `CMSG_USER`.
    fn username(&self) -> String;

    /// Password for password authentication. `None` skips the method.
    async fn password(&self, prompt: &str) -> Option<String>;

    /// Response to a server challenge (TIS, token codes). `None` aborts the method.
    async fn challenge_response(&self, prompt: &str) -> Option<String>;

    /// Authentication types in preference order (SSH-1 auth type ids).
    fn auth_preferences(&self) -> Vec<u8>;

    /// Preferred cipher (SSH-1 cipher id).
    fn cipher_preference(&self) -> u8;

    /// Identity used for RSA and rhosts-RSA authentication.
    fn identity(&self) -> Option<IdentityMaterial>;

    /// Decides whether the host key presented by `host:port` is trusted.
    ///
    /// Implementations may record the key. Returning `Ok(false)` rejects
    /// the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the trust store cannot be consulted.
    async fn verify_host_key(&self, host: &str, port: u16, key: &HostKeyInfo) -> TernResult<bool>;
}

/// Terminal size in characters and pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TerminalSize {
    /// Rows
    pub rows: u32,
    /// Columns
    pub cols: u32,
    /// Width in pixels (0 if unknown)
    pub width_px: u32,
    /// Height in pixels (0 if unknown)
    pub height_px: u32,
}

impl TerminalSize {
    /// Creates a size in characters with unknown pixel dimensions.
    pub fn new(rows: u32, cols: u32) -> Self {
        Self {
            rows,
            cols,
            width_px: 0,
            height_px: 0,
        }
    }
}

/// Terminal sink for the interactive session.
pub trait Console: Send + Sync {
    /// Terminal type for the PTY request (e.g. `"xterm"`).
    fn terminal_type(&self) -> String;

    /// Current terminal size.
    fn terminal_size(&self) -> TerminalSize;

    /// Data from the remote shell's stdout.
    fn write_output(&self, data: &[u8]);

    /// Data from the remote shell's stderr.
    fn write_error(&self, data: &[u8]);

    /// Called once the session is open, with the negotiated cipher name.
    fn session_opened(&self, cipher: &str);

    /// Called once when the session ends.
    fn session_closed(&self, exit_status: Option<u32>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingInteractor {
        reports: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Interactor for RecordingInteractor {
        fn report(&self, message: &str) {
            self.reports.lock().unwrap().push(message.to_string());
        }

        fn alert(&self, message: &str) {
            self.reports.lock().unwrap().push(format!("ALERT {}", message));
        }

        async fn prompt_line(&self, _prompt: &str, _echo: bool) -> Option<String> {
            Some("answer".to_string())
        }

        async fn ask_confirmation(&self, _question: &str, default: bool) -> bool {
            default
        }
    }

    #[tokio::test]
    async fn test_interactor_object_safety() {
        let interactor = RecordingInteractor {
            reports: Mutex::new(Vec::new()),
        };
        let dynamic: &dyn Interactor = &interactor;

        dynamic.report("hello");
        dynamic.alert("careful");
        assert_eq!(dynamic.prompt_line("?", true).await.as_deref(), Some("answer"));
        assert!(dynamic.ask_confirmation("ok?", true).await);
        assert_eq!(
            *interactor.reports.lock().unwrap(),
            vec!["hello".to_string(), "ALERT careful".to_string()]
        );
    }

    #[test]
    fn test_terminal_size() {
        let size = TerminalSize::new(24, 80);
        assert_eq!(size.rows, 24);
        assert_eq!(size.cols, 80);
        assert_eq!(size.width_px, 0);
    }

    #[test]
    fn test_identity_debug_redacts() {
        let identity = IdentityMaterial {
            file: vec![1, 2, 3],
            passphrase: Some("secret".to_string()),
        };
        let shown = format!("{:?}", identity);
        assert!(!shown.contains("secret"));
        assert!(shown.contains("<3 bytes>"));
    }
}
