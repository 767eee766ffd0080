//! Local port forwarding (client listens, server connects).
//!
//! # How it works
//!
//! 1. Listen on the rule's bind address (e.g., 127.0.0.1:8080)
//! 2. When a connection arrives, send `MSG_PORT_OPEN` for the rule's target
//! 3. Once the server confirms, relay data between the socket and the channel
//!
//! # Example
//!
//! ```rust,no_run
//! use tern_proto::ssh1::forwarding::parse_forward_rule;
//! # use tern_proto::ssh1::client::Client;
//!
//! # async fn demo(client: &Client) -> tern_platform::TernResult<()> {
//! let rule = parse_forward_rule("8080:database.internal:5432")?;
//! let bound = client.add_local_forward(rule).await?;
//! println!("listening on {}", bound);
//! # Ok(())
//! # }
//! ```

use super::types::ForwardRule;
use crate::ssh1::channel::ChannelController;
use crate::ssh1::logging;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tern_platform::TernResult;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// First pause after a failed accept.
pub const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(50);

/// Longest pause between accept retries.
pub const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Pause before retrying after `failures` consecutive accept errors.
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1u32 << failures.saturating_sub(1).min(16))
        .min(ACCEPT_BACKOFF_MAX)
}

/// A bound local forward.
#[derive(Debug)]
pub struct LocalForward {
    /// TCP listener for incoming connections
    listener: TcpListener,
    /// Bind and target addresses
    rule: ForwardRule,
    /// Address actually bound (port 0 resolved)
    local_addr: SocketAddr,
    /// Connection counter
    connection_counter: Arc<AtomicU64>,
}

impl LocalForward {
    /// Binds the rule's listening address.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Io`](tern_platform::TernError::Io) if the address
    /// cannot be bound.
    pub async fn bind(rule: ForwardRule) -> TernResult<Self> {
        let listener = TcpListener::bind((rule.bind.host.as_str(), rule.bind.port)).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            rule,
            local_addr,
            connection_counter: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Returns the address this forwarder is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the forward rule.
    pub fn rule(&self) -> &ForwardRule {
        &self.rule
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> u64 {
        self.connection_counter.load(Ordering::Relaxed)
    }

    /// Accepts connections until the session's writer stops or the task is
    /// aborted.
    pub async fn run(self, controller: Arc<ChannelController>) -> TernResult<()> {
        info!(
            "Local forward listening on {} -> {}",
            self.local_addr, self.rule.target
        );

        let mut failures = 0u32;
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => {
                    failures = 0;
                    accepted
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let pause = accept_backoff(failures);
                    warn!(
                        "Accept failed on {} ({} in a row), retrying in {:?}: {}",
                        self.local_addr, failures, pause, e
                    );
                    tokio::time::sleep(pause).await;
                    continue;
                }
            };
            let connection_id = self.connection_counter.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(
                "[Connection #{}] Accepted from {} -> {}",
                connection_id, peer, self.rule.target
            );
            if let Err(e) = stream.set_nodelay(true) {
                debug!("[Connection #{}] Could not set TCP_NODELAY: {}", connection_id, e);
            }

            if let Err(e) =
                controller.open_listen_channel(stream, &self.rule.target, &peer.to_string())
            {
                logging::log_forward_failed("local", &self.rule.target.to_string(), &e.to_string());
                return Err(e);
            }
        }
    }

    /// Runs the forward on a background task.
    pub fn spawn(self, controller: Arc<ChannelController>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let bind = self.local_addr;
            if let Err(e) = self.run(controller).await {
                debug!("Local forward on {} stopped: {}", bind, e);
            }
        })
    }
}
