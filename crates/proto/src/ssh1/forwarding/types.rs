//! Common types and utilities for port forwarding.

use tern_platform::{TernError, TernResult};
use std::net::{IpAddr, SocketAddr};

/// Forward address specification.
///
/// Can be either a socket address (IP:port) or a host:port pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ForwardAddr {
    /// Host or IP address
    pub host: String,
    /// Port number
    pub port: u16,
}

impl ForwardAddr {
    /// Creates a new forward address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Converts to a socket address if the host is an IP address.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl std::fmt::Display for ForwardAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parses a forward address from a string.
///
/// Accepts formats:
/// - "host:port" - e.g., "localhost:8080"
/// - "[host]:port" - e.g., "[::1]:8080" for IPv6
///
/// # Example
///
/// ```rust
/// use tern_proto::ssh1::forwarding::parse_forward_addr;
///
/// let addr = parse_forward_addr("localhost:8080").unwrap();
/// assert_eq!(addr.host, "localhost");
/// assert_eq!(addr.port, 8080);
/// ```
pub fn parse_forward_addr(addr: &str) -> TernResult<ForwardAddr> {
    if let Some(rest) = addr.strip_prefix('[') {
        let end_bracket = rest.find(']').ok_or_else(|| {
            TernError::Config(format!("Invalid IPv6 address: missing ']': {}", addr))
        })?;
        let host = &rest[..end_bracket];
        let port_part = rest[end_bracket + 1..].strip_prefix(':').ok_or_else(|| {
            TernError::Config(format!(
                "Invalid address format: missing ':' after ']': {}",
                addr
            ))
        })?;
        return Ok(ForwardAddr::new(host, parse_port(port_part)?));
    }

    let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
        TernError::Config(format!(
            "Invalid address format: expected 'host:port', got '{}'",
            addr
        ))
    })?;
    Ok(ForwardAddr::new(host, parse_port(port)?))
}

fn parse_port(port: &str) -> TernResult<u16> {
    port.parse::<u16>()
        .map_err(|_| TernError::Config(format!("Invalid port number: {}", port)))
}

/// A configured local or remote forward.
///
/// For a local forward `bind` is a local listening address and `target` is
/// reached from the server. For a remote forward `bind` is the port the
/// server listens on and `target` is reached from this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ForwardRule {
    /// Listening side.
    pub bind: ForwardAddr,
    /// Connecting side.
    pub target: ForwardAddr,
    /// Tag of the component that registered the rule (`"general"` for
    /// user-configured forwards).
    pub plugin: String,
}

impl ForwardRule {
    /// Creates a user-configured rule.
    pub fn new(bind: ForwardAddr, target: ForwardAddr) -> Self {
        Self {
            bind,
            target,
            plugin: "general".to_string(),
        }
    }

    /// Sets the owning plugin tag.
    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = plugin.into();
        self
    }
}

impl std::fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.bind, self.target)
    }
}

/// Parses `[bind_host:]bind_port:target_host:target_port`.
///
/// A missing bind host means `127.0.0.1`.
///
/// # Example
///
/// ```rust
/// use tern_proto::ssh1::forwarding::parse_forward_rule;
///
/// let rule = parse_forward_rule("8080:intranet:80").unwrap();
/// assert_eq!(rule.bind.to_string(), "127.0.0.1:8080");
/// assert_eq!(rule.target.to_string(), "intranet:80");
/// ```
pub fn parse_forward_rule(spec: &str) -> TernResult<ForwardRule> {
    let (bind_part, target_part) = split_rule(spec)?;
    let bind = if bind_part.contains(':') {
        parse_forward_addr(bind_part)?
    } else {
        ForwardAddr::new("127.0.0.1", parse_port(bind_part)?)
    };
    Ok(ForwardRule::new(bind, parse_forward_addr(target_part)?))
}

fn split_rule(spec: &str) -> TernResult<(&str, &str)> {
    // Target is always the last "host:port" (or "[v6]:port") pair.
    let port_sep = spec.rfind(':');
    let host_sep = port_sep.and_then(|idx| {
        let head = &spec[..idx];
        if head.ends_with(']') {
            head.rfind('[').and_then(|open| open.checked_sub(1))
        } else {
            head.rfind(':')
        }
    });
    match host_sep {
        Some(idx) if spec.as_bytes().get(idx) == Some(&b':') => {
            Ok((&spec[..idx], &spec[idx + 1..]))
        }
        _ => Err(TernError::Config(format!(
            "Invalid forward '{}': expected [bind_host:]port:host:port",
            spec
        ))),
    }
}
