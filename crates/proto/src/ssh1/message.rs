//! SSH-1 protocol message types (protocol 1.5).
//!
//! SSH-1 uses a single flat numbering for every message, client and server.
//! The `SMSG_`/`CMSG_`/`MSG_` prefixes in [`MessageType::name`] tell which
//! side sends it.
//!
//! # Message Categories
//!
//! - **Transport** (1-3, 32, 36): disconnect, key exchange, ignore, debug
//! - **Authentication** (4-9, 14-15, 35, 39-41, 64-71): user, methods, results
//! - **Session setup** (10-13, 28, 34, 37-38): PTY, shell, forwarding, compression
//! - **Interactive data** (16-20, 33): stdin/stdout/stderr, EOF, exit status
//! - **Channels** (21-25, 27, 29): open/confirm/data/close, X11 and port opens
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh1::message::MessageType;
//!
//! let msg_type = MessageType::PublicKey;
//! assert_eq!(msg_type as u8, 2);
//! ```

/// SSH-1 message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Connection termination with a reason string.
    Disconnect = 1,
    /// Server public keys, cookie and capability masks.
    PublicKey = 2,
    /// Encrypted session key and chosen cipher.
    SessionKey = 3,
    /// Login name.
    User = 4,
    /// Rhosts authentication.
    AuthRhosts = 5,
    /// RSA authentication, carries the identity modulus.
    AuthRsa = 6,
    /// Encrypted RSA challenge.
    AuthRsaChallenge = 7,
    /// MD5 response to the RSA challenge.
    AuthRsaResponse = 8,
    /// Password authentication.
    AuthPassword = 9,
    /// Pseudo-terminal request.
    RequestPty = 10,
    /// Terminal size change.
    WindowSize = 11,
    /// Start an interactive shell.
    ExecShell = 12,
    /// Run a single command.
    ExecCmd = 13,
    /// Generic success.
    Success = 14,
    /// Generic failure.
    Failure = 15,
    /// Interactive input. Also `CMSG_AUTH_SDI` while authenticating.
    StdinData = 16,
    /// Interactive output.
    StdoutData = 17,
    /// Interactive error output.
    StderrData = 18,
    /// End of interactive input.
    Eof = 19,
    /// Remote command exit status.
    ExitStatus = 20,
    /// Channel open accepted.
    ChannelOpenConfirmation = 21,
    /// Channel open rejected.
    ChannelOpenFailure = 22,
    /// Data on a channel.
    ChannelData = 23,
    /// Channel close (first half of the close handshake).
    ChannelClose = 24,
    /// Channel close acknowledgement.
    ChannelCloseConfirmation = 25,
    /// Server opens an X11 channel.
    X11Open = 27,
    /// Ask the server to listen on a port.
    PortForwardRequest = 28,
    /// Open a TCP channel (either side).
    PortOpen = 29,
    /// Agent forwarding request.
    AgentRequestForwarding = 30,
    /// Server opens an agent channel.
    AgentOpen = 31,
    /// Ignored data.
    Ignore = 32,
    /// Acknowledges the exit status.
    ExitConfirmation = 33,
    /// X11 forwarding request.
    X11RequestForwarding = 34,
    /// Rhosts-RSA authentication.
    AuthRhostsRsa = 35,
    /// Debug message.
    Debug = 36,
    /// Compression request.
    RequestCompression = 37,
    /// Maximum packet size request.
    MaxPacketSize = 38,
    /// TIS challenge/response authentication.
    AuthTis = 39,
    /// TIS challenge text.
    AuthTisChallenge = 40,
    /// TIS response.
    AuthTisResponse = 41,
    /// Token accepted.
    AcmOk = 64,
    /// Token access denied.
    AcmAccessDenied = 65,
    /// Next token code required.
    AcmNextCodeRequired = 66,
    /// Next token code.
    AcmNextCode = 67,
    /// New PIN required.
    AcmNewPinRequired = 68,
    /// New PIN accepted.
    AcmNewPinAccepted = 69,
    /// New PIN rejected.
    AcmNewPinRejected = 70,
    /// New PIN.
    AcmNewPin = 71,
}

impl MessageType {
    /// Token (SecurID) authentication request. Shares its number with
    /// `STDIN_DATA`; only valid before the session is open.
    pub const AUTH_SDI: MessageType = MessageType::StdinData;

    /// Converts a byte to a message type.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tern_proto::ssh1::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(14), Some(MessageType::Success));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        use MessageType::*;
        let msg = match byte {
            1 => Disconnect,
            2 => PublicKey,
            3 => SessionKey,
            4 => User,
            5 => AuthRhosts,
            6 => AuthRsa,
            7 => AuthRsaChallenge,
            8 => AuthRsaResponse,
            9 => AuthPassword,
            10 => RequestPty,
            11 => WindowSize,
            12 => ExecShell,
            13 => ExecCmd,
            14 => Success,
            15 => Failure,
            16 => StdinData,
            17 => StdoutData,
            18 => StderrData,
            19 => Eof,
            20 => ExitStatus,
            21 => ChannelOpenConfirmation,
            22 => ChannelOpenFailure,
            23 => ChannelData,
            24 => ChannelClose,
            25 => ChannelCloseConfirmation,
            27 => X11Open,
            28 => PortForwardRequest,
            29 => PortOpen,
            30 => AgentRequestForwarding,
            31 => AgentOpen,
            32 => Ignore,
            33 => ExitConfirmation,
            34 => X11RequestForwarding,
            35 => AuthRhostsRsa,
            36 => Debug,
            37 => RequestCompression,
            38 => MaxPacketSize,
            39 => AuthTis,
            40 => AuthTisChallenge,
            41 => AuthTisResponse,
            64 => AcmOk,
            65 => AcmAccessDenied,
            66 => AcmNextCodeRequired,
            67 => AcmNextCode,
            68 => AcmNewPinRequired,
            69 => AcmNewPinAccepted,
            70 => AcmNewPinRejected,
            71 => AcmNewPin,
            _ => return None,
        };
        Some(msg)
    }

    /// Returns the protocol name of the message.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tern_proto::ssh1::message::MessageType;
    ///
    /// assert_eq!(MessageType::PublicKey.name(), "SSH_SMSG_PUBLIC_KEY");
    /// ```
    pub fn name(&self) -> &'static str {
        use MessageType::*;
        match self {
            Disconnect => "SSH_MSG_DISCONNECT",
            PublicKey => "SSH_SMSG_PUBLIC_KEY",
            SessionKey => "SSH_CMSG_SESSION_KEY",
            User => "SSH_CMSG_USER",
            AuthRhosts => "SSH_CMSG_AUTH_RHOSTS",
            AuthRsa => "SSH_CMSG_AUTH_RSA",
            AuthRsaChallenge => "SSH_SMSG_AUTH_RSA_CHALLENGE",
            AuthRsaResponse => "SSH_CMSG_AUTH_RSA_RESPONSE",
            AuthPassword => "SSH_CMSG_AUTH_PASSWORD",
            RequestPty => "SSH_CMSG_REQUEST_PTY",
            WindowSize => "SSH_CMSG_WINDOW_SIZE",
            ExecShell => "SSH_CMSG_EXEC_SHELL",
            ExecCmd => "SSH_CMSG_EXEC_CMD",
            Success => "SSH_SMSG_SUCCESS",
            Failure => "SSH_SMSG_FAILURE",
            StdinData => "SSH_CMSG_STDIN_DATA",
            StdoutData => "SSH_SMSG_STDOUT_DATA",
            StderrData => "SSH_SMSG_STDERR_DATA",
            Eof => "SSH_CMSG_EOF",
            ExitStatus => "SSH_SMSG_EXITSTATUS",
            ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            ChannelData => "SSH_MSG_CHANNEL_DATA",
            ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            ChannelCloseConfirmation => "SSH_MSG_CHANNEL_CLOSE_CONFIRMATION",
            X11Open => "SSH_SMSG_X11_OPEN",
            PortForwardRequest => "SSH_CMSG_PORT_FORWARD_REQUEST",
            PortOpen => "SSH_MSG_PORT_OPEN",
            AgentRequestForwarding => "SSH_CMSG_AGENT_REQUEST_FORWARDING",
            AgentOpen => "SSH_SMSG_AGENT_OPEN",
            Ignore => "SSH_MSG_IGNORE",
            ExitConfirmation => "SSH_CMSG_EXIT_CONFIRMATION",
            X11RequestForwarding => "SSH_CMSG_X11_REQUEST_FORWARDING",
            AuthRhostsRsa => "SSH_CMSG_AUTH_RHOSTS_RSA",
            Debug => "SSH_MSG_DEBUG",
            RequestCompression => "SSH_CMSG_REQUEST_COMPRESSION",
            MaxPacketSize => "SSH_CMSG_MAX_PACKET_SIZE",
            AuthTis => "SSH_CMSG_AUTH_TIS",
            AuthTisChallenge => "SSH_SMSG_AUTH_TIS_CHALLENGE",
            AuthTisResponse => "SSH_CMSG_AUTH_TIS_RESPONSE",
            AcmOk => "SSH_CMSG_ACM_OK",
            AcmAccessDenied => "SSH_CMSG_ACM_ACCESS_DENIED",
            AcmNextCodeRequired => "SSH_CMSG_ACM_NEXT_CODE_REQUIRED",
            AcmNextCode => "SSH_CMSG_ACM_NEXT_CODE",
            AcmNewPinRequired => "SSH_CMSG_ACM_NEW_PIN_REQUIRED",
            AcmNewPinAccepted => "SSH_CMSG_ACM_NEW_PIN_ACCEPTED",
            AcmNewPinRejected => "SSH_CMSG_ACM_NEW_PIN_REJECTED",
            AcmNewPin => "SSH_CMSG_ACM_NEW_PIN",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Display helper for raw type bytes that may not be known.
pub fn describe(msg_type: u8) -> String {
    match MessageType::from_u8(msg_type) {
        Some(known) => known.to_string(),
        None => format!("UNKNOWN({})", msg_type),
    }
}
