//! SSH-1 identification line exchange.
//!
//! Both sides open the connection with a single text line:
//!
//! ```text
//! SSH-<major>.<minor>-<comment>\n
//! ```
//!
//! This client speaks protocol 1.5. Servers announcing `SSH-1.99` speak
//! both protocol generations and are treated as 1.5.
//!
//! # Security
//!
//! - Maximum line length: 255 characters
//! - No null bytes allowed in the line
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh1::version::Version;
//!
//! let server = Version::parse("SSH-1.5-OpenSSH_3.9p1\n").unwrap();
//! assert_eq!(server.major(), 1);
//! assert_eq!(server.comment(), "OpenSSH_3.9p1");
//!
//! let ours = Version::client("Tern_0.1.0");
//! assert_eq!(ours.to_wire_format(), b"SSH-1.5-Tern_0.1.0\n");
//! ```

use tern_platform::{TernError, TernResult};

/// Maximum length of an identification line.
pub const MAX_VERSION_LENGTH: usize = 255;

/// Protocol major version spoken by this client.
pub const PROTOCOL_MAJOR: u32 = 1;

/// Lowest protocol minor version accepted.
pub const PROTOCOL_MINOR: u32 = 5;

/// Minor version that announces dual SSH-1/SSH-2 support.
const DUAL_PROTOCOL_MINOR: u32 = 99;

/// An SSH-1 identification line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    major: u32,
    minor: u32,
    comment: String,
}

impl Version {
    /// Identification line this client sends.
    pub fn client(software: &str) -> Self {
        Self {
            major: PROTOCOL_MAJOR,
            minor: PROTOCOL_MINOR,
            comment: software.to_string(),
        }
    }

    /// Parses and validates a server identification line.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Protocol`] if:
    /// - the line is too long or contains a null byte
    /// - the line is not of the form `SSH-<major>.<minor>-<comment>`
    /// - the major version is above 1 (protocol too new)
    /// - the version is below 1.5 (protocol too old)
    ///
    /// # Example
    ///
    /// ```rust
    /// use tern_proto::ssh1::version::Version;
    ///
    /// let err = Version::parse("SSH-0.9-OpenSSH").unwrap_err();
    /// assert!(err.to_string().contains("too old"));
    /// ```
    pub fn parse(line: &str) -> TernResult<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(TernError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(TernError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }

        let malformed = || TernError::Protocol(format!("Malformed version string: '{}'", line));

        let rest = line.strip_prefix("SSH-").ok_or_else(malformed)?;
        let (numbers, comment) = rest.split_once('-').ok_or_else(malformed)?;
        let (major, minor) = numbers.split_once('.').ok_or_else(malformed)?;
        let major: u32 = major.parse().map_err(|_| malformed())?;
        let minor: u32 = minor.parse().map_err(|_| malformed())?;

        if major > PROTOCOL_MAJOR {
            return Err(TernError::Protocol(format!(
                "Server protocol version {}.{} is too new (this client speaks {}.{})",
                major, minor, PROTOCOL_MAJOR, PROTOCOL_MINOR
            )));
        }
        if major < PROTOCOL_MAJOR || minor < PROTOCOL_MINOR {
            return Err(TernError::Protocol(format!(
                "Server protocol version {}.{} is too old (minimum {}.{})",
                major, minor, PROTOCOL_MAJOR, PROTOCOL_MINOR
            )));
        }

        Ok(Self {
            major,
            minor,
            comment: comment.to_string(),
        })
    }

    /// Major version.
    pub fn major(&self) -> u32 {
        self.major
    }

    /// Minor version as announced.
    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Minor version actually spoken; `1.99` servers are driven as `1.5`.
    pub fn effective_minor(&self) -> u32 {
        if self.minor == DUAL_PROTOCOL_MINOR {
            PROTOCOL_MINOR
        } else {
            self.minor
        }
    }

    /// Software/comment part of the line.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Wire form, terminated by a single LF.
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}.{}-{}", self.major, self.minor, self.comment)
    }
}
