//! Remote port forwarding (server listens, client connects).
//!
//! # How it works
//!
//! 1. During setup the client sends `CMSG_PORT_FORWARD_REQUEST` for every
//!    configured remote forward, one at a time
//! 2. Rules the server acknowledges with `SMSG_SUCCESS` are registered here
//! 3. When a connection arrives at the server it sends `MSG_PORT_OPEN` with
//!    the target the client asked for
//! 4. The target is checked against the registered rules, rewritten through
//!    the [`HostMap`](super::HostMap) and connected; the channel controller
//!    answers with a confirmation or a failure

use super::types::{ForwardAddr, ForwardRule};
use crate::ssh1::message::MessageType;
use crate::ssh1::packet::Packet;
use std::time::Duration;
use tern_platform::{TernError, TernResult};
use tokio::net::TcpStream;
use tracing::debug;

/// Builds `CMSG_PORT_FORWARD_REQUEST` for a rule.
///
/// ```text
/// uint32    port the server listens on
/// string    host to connect to
/// uint32    port to connect to
/// ```
pub fn port_forward_request(rule: &ForwardRule) -> Packet {
    let mut packet = Packet::new(MessageType::PortForwardRequest);
    packet
        .put_u32(u32::from(rule.bind.port))
        .put_string(rule.target.host.as_bytes())
        .put_u32(u32::from(rule.target.port));
    packet
}

/// Remote forwards the server has agreed to.
#[derive(Debug, Clone, Default)]
pub struct RemoteForwards {
    rules: Vec<ForwardRule>,
}

impl RemoteForwards {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an acknowledged rule.
    pub fn register(&mut self, rule: ForwardRule) {
        debug!(rule = %rule, "Remote forward registered");
        self.rules.push(rule);
    }

    /// Finds the rule whose target matches a `MSG_PORT_OPEN` request.
    pub fn find(&self, target: &ForwardAddr) -> Option<&ForwardRule> {
        self.rules.iter().find(|rule| &rule.target == target)
    }

    /// Registered rules.
    pub fn rules(&self) -> &[ForwardRule] {
        &self.rules
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Opens the outbound socket for an inbound channel request.
///
/// # Errors
///
/// Returns [`TernError::Io`] if the connection fails and
/// [`TernError::Timeout`] if it does not complete within `timeout`.
pub async fn connect_target(target: &ForwardAddr, timeout: Duration) -> TernResult<TcpStream> {
    let connect = TcpStream::connect((target.host.as_str(), target.port));
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(TernError::Io(e)),
        Err(_) => Err(TernError::Timeout(format!(
            "Connecting to {} took longer than {:?}",
            target, timeout
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh1::forwarding::parse_forward_rule;
    use tokio::net::TcpListener;

    #[test]
    fn test_port_forward_request_layout() {
        let rule = parse_forward_rule("8080:web.internal:80").unwrap();
        let packet = port_forward_request(&rule);
        let mut reader = packet.reader();
        assert_eq!(reader.get_u32().unwrap(), 8080);
        assert_eq!(reader.get_text().unwrap(), "web.internal");
        assert_eq!(reader.get_u32().unwrap(), 80);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_registry_lookup() {
        let mut forwards = RemoteForwards::new();
        assert!(forwards.is_empty());
        forwards.register(parse_forward_rule("8080:web:80").unwrap());

        assert!(forwards.find(&ForwardAddr::new("web", 80)).is_some());
        assert!(forwards.find(&ForwardAddr::new("web", 81)).is_none());
        assert_eq!(forwards.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = ForwardAddr::new("127.0.0.1", port);
        assert!(connect_target(&target, Duration::from_secs(5)).await.is_ok());

        drop(listener);
        let err = connect_target(&target, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, TernError::Io(_)));
    }
}
