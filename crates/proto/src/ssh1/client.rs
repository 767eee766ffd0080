//! SSH-1 client.
//!
//! [`Client::connect`] opens the TCP connection, runs the handshake on the
//! session tasks and returns once the shell or command is running. The
//! returned handle feeds the interactive session and manages forwards
//! while the session runs.
//!
//! # Example
//!
//! ```rust,no_run
//! use tern_proto::ssh1::client::{Client, Collaborators};
//! use tern_proto::ssh1::config::SessionConfig;
//!
//! # async fn demo(collaborators: Collaborators) -> tern_platform::TernResult<()> {
//! let config = SessionConfig::new("legacy.example.com", 22).with_command("uname -a");
//! let client = Client::connect(config, collaborators).await?;
//!
//! // Output arrives through the Console collaborator.
//! let status = client.wait_exit().await?;
//! println!("remote command exited with {:?}", status);
//! # Ok(())
//! # }
//! ```

use crate::ssh1::channel::ChannelInfo;
use crate::ssh1::config::SessionConfig;
use crate::ssh1::forwarding::{ForwardAddr, ForwardRule, HostMap};
use crate::ssh1::message::MessageType;
use crate::ssh1::packet::Packet;
use crate::ssh1::session::{self, replicate_error, SessionShared, SessionStatus};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tern_platform::{TerminalSize, TernError, TernResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info};

pub use crate::ssh1::session::Collaborators;

/// Handle to an open SSH-1 session.
///
/// Dropping the handle shuts the session down.
#[derive(Debug)]
pub struct Client {
    shared: Arc<SessionShared>,
}

impl Client {
    /// Connects to the configured server and waits until the session is
    /// open.
    ///
    /// # Errors
    ///
    /// - [`TernError::Config`] if the configuration is invalid
    /// - [`TernError::Io`] if the connection fails or times out
    /// - any handshake error, see [`Client::connect_stream`]
    pub async fn connect(config: SessionConfig, collaborators: Collaborators) -> TernResult<Self> {
        config.validate()?;
        info!("Connecting to {}", config.peer());

        let stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| {
            TernError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Connection timeout",
            ))
        })?
        .map_err(TernError::Io)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", config.peer(), e);
        }

        Self::connect_stream(stream, config, collaborators).await
    }

    /// Runs the session over an already connected stream.
    ///
    /// Waits at most `hello_timeout + kex_timeout` for the session to open.
    /// If the handshake failed before the deadline, that error is returned
    /// rather than the timeout.
    ///
    /// # Errors
    ///
    /// - [`TernError::Timeout`] if no identification arrives or the session
    ///   does not open in time
    /// - [`TernError::Security`] for key-size, host-key or cipher rejection
    /// - [`TernError::Authentication`] when every method failed
    /// - [`TernError::Disconnected`] if the server hung up with a reason
    pub async fn connect_stream<S>(
        stream: S,
        config: SessionConfig,
        collaborators: Collaborators,
    ) -> TernResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;
        let open_timeout = config.hello_timeout + config.kex_timeout;
        let client = Self {
            shared: session::start(stream, config, collaborators),
        };
        client.wait_open(open_timeout).await?;
        Ok(client)
    }

    async fn wait_open(&self, limit: Duration) -> TernResult<()> {
        let mut rx = self.shared.subscribe();
        match tokio::time::timeout(limit, wait_until_settled(&mut rx)).await {
            Ok(SessionStatus::Open { .. }) => Ok(()),
            Ok(SessionStatus::Failed(e)) => Err(replicate_error(&e)),
            Ok(_) => Err(TernError::Disconnected(
                "Session closed during the handshake".to_string(),
            )),
            Err(_) => {
                if let SessionStatus::Failed(e) = self.shared.status() {
                    return Err(replicate_error(&e));
                }
                let message = format!(
                    "Session with {} not open after {:?}",
                    self.shared.peer(),
                    limit
                );
                self.shared
                    .shutdown(Some(TernError::Timeout(message.clone())));
                Err(TernError::Timeout(message))
            }
        }
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    /// Server address as `host:port`.
    pub fn peer(&self) -> &str {
        self.shared.peer()
    }

    fn ensure_open(&self) -> TernResult<()> {
        if self.shared.is_open() {
            Ok(())
        } else {
            Err(TernError::Protocol(format!(
                "Session with {} is not open",
                self.shared.peer()
            )))
        }
    }

    /// Sends keyboard input to the remote shell.
    pub fn send_stdin(&self, data: &[u8]) -> TernResult<()> {
        self.ensure_open()?;
        let mut packet = Packet::new(MessageType::StdinData);
        packet.put_string(data);
        self.shared.sender().send(packet)
    }

    /// Signals end of input.
    pub fn send_eof(&self) -> TernResult<()> {
        self.ensure_open()?;
        self.shared.sender().send(Packet::new(MessageType::Eof))
    }

    /// Reports a new terminal size.
    pub fn resize(&self, size: TerminalSize) -> TernResult<()> {
        self.ensure_open()?;
        let mut packet = Packet::new(MessageType::WindowSize);
        packet
            .put_u32(size.rows)
            .put_u32(size.cols)
            .put_u32(size.width_px)
            .put_u32(size.height_px);
        self.shared.sender().send(packet)
    }

    /// Waits for the session to end and returns the remote exit status.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the session, if any.
    pub async fn wait_exit(&self) -> TernResult<Option<u32>> {
        let mut rx = self.shared.subscribe();
        loop {
            let settled = match &*rx.borrow_and_update() {
                SessionStatus::Closed { exit_status } => Some(Ok(*exit_status)),
                SessionStatus::Failed(e) => Some(Err(replicate_error(e))),
                _ => None,
            };
            if let Some(result) = settled {
                return result;
            }
            if rx.changed().await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Sends `MSG_DISCONNECT` and shuts the session down.
    pub fn disconnect(&self, reason: &str) {
        if self.shared.status().is_terminal() {
            return;
        }
        let mut packet = Packet::new(MessageType::Disconnect);
        packet.put_string(reason.as_bytes());
        if let Err(e) = self.shared.sender().send(packet) {
            debug!("Disconnect message to {} not sent: {}", self.shared.peer(), e);
        }
        self.shared.set_graceful();
        self.shared.shutdown(None);
    }

    /// Starts a local forward while the session runs.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Io`] if the address cannot be bound.
    pub async fn add_local_forward(&self, rule: ForwardRule) -> TernResult<SocketAddr> {
        self.ensure_open()?;
        self.shared.controller().add_local_forward(rule).await
    }

    /// Stops the local forward bound to `bind`.
    pub fn remove_local_forward(&self, bind: &ForwardAddr) -> bool {
        self.shared.controller().remove_local_forward(bind)
    }

    /// Rewrite table for connections the server opens.
    pub fn host_map(&self) -> Arc<HostMap> {
        Arc::clone(self.shared.controller().host_map())
    }

    /// Open channels.
    pub fn channels(&self) -> Vec<ChannelInfo> {
        self.shared.controller().channels()
    }

    /// Changes or disables the keep-alive interval.
    pub fn set_keepalive(&self, interval: Option<Duration>) {
        self.shared.set_keepalive(interval);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.set_graceful();
        self.shared.shutdown(None);
    }
}

async fn wait_until_settled(rx: &mut watch::Receiver<SessionStatus>) -> SessionStatus {
    loop {
        let status = rx.borrow_and_update().clone();
        if !matches!(status, SessionStatus::Connecting) {
            return status;
        }
        if rx.changed().await.is_err() {
            return status;
        }
    }
}
