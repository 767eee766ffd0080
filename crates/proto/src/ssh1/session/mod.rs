//! SSH-1 session lifecycle.
//!
//! A session runs as three tasks:
//! - the **reader** owns the inbound decoder and the [`Handshake`]; after the
//!   session opens it hands packets to the [`ChannelController`]
//! - the **writer** (see [`transport`](crate::ssh1::transport)) owns the
//!   outbound cipher and compressor
//! - the **watchdog** waits for either of them to end and runs the single
//!   shutdown path
//!
//! Callers observe progress through a `watch` cell holding the
//! [`SessionStatus`].

pub mod keepalive;

pub use keepalive::{keepalive_packet, KeepaliveTask};

use crate::ssh1::channel::{ChannelController, Received};
use crate::ssh1::cipher::CipherKind;
use crate::ssh1::codec::{Decoded, PacketDecoder};
use crate::ssh1::config::SessionConfig;
use crate::ssh1::forwarding::HostMap;
use crate::ssh1::handshake::{Handshake, OpenSession, Progress};
use crate::ssh1::logging;
use crate::ssh1::transport::{read_version_line, spawn_writer, PacketSender};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tern_platform::{Authenticator, Console, Interactor, TernError, TernResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinError};
use tracing::{debug, info};

/// Read size for the connection.
const READ_CHUNK: usize = 16 * 1024;

/// Where a session is.
#[derive(Debug, Clone)]
pub enum SessionStatus {
    /// Handshake in progress.
    Connecting,
    /// Shell or command running.
    Open {
        /// Negotiated cipher.
        cipher: CipherKind,
    },
    /// Ended normally.
    Closed {
        /// Exit status of the remote command, if it reported one.
        exit_status: Option<u32>,
    },
    /// Ended by an error.
    Failed(Arc<TernError>),
}

impl SessionStatus {
    /// Whether the session has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Closed { .. } | SessionStatus::Failed(_))
    }
}

/// The external parties a session talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Credentials, preferences and host-key trust.
    pub authenticator: Arc<dyn Authenticator>,
    /// Reports and prompts.
    pub interactor: Arc<dyn Interactor>,
    /// Terminal sink.
    pub console: Arc<dyn Console>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Collaborators { .. }")
    }
}

/// Copies an error for another waiter. I/O errors keep their kind and
/// message.
pub fn replicate_error(err: &TernError) -> TernError {
    match err {
        TernError::Io(e) => TernError::Io(io::Error::new(e.kind(), e.to_string())),
        TernError::Config(m) => TernError::Config(m.clone()),
        TernError::Protocol(m) => TernError::Protocol(m.clone()),
        TernError::Security(m) => TernError::Security(m.clone()),
        TernError::Authentication(m) => TernError::Authentication(m.clone()),
        TernError::Disconnected(m) => TernError::Disconnected(m.clone()),
        TernError::Timeout(m) => TernError::Timeout(m.clone()),
        TernError::NotImplemented(m) => TernError::NotImplemented(m.clone()),
    }
}

/// State shared by the session tasks and the client handle.
pub struct SessionShared {
    peer: String,
    config: Arc<SessionConfig>,
    collaborators: Collaborators,
    status: watch::Sender<SessionStatus>,
    graceful: AtomicBool,
    opened: AtomicBool,
    closed: AtomicBool,
    sender: PacketSender,
    controller: Arc<ChannelController>,
    keepalive: Mutex<KeepaliveTask>,
    reader: Mutex<Option<AbortHandle>>,
    started: Instant,
}

impl SessionShared {
    /// Peer address as `host:port`.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue for outbound packets.
    pub fn sender(&self) -> &PacketSender {
        &self.sender
    }

    /// Channel controller of this session.
    pub fn controller(&self) -> &Arc<ChannelController> {
        &self.controller
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Subscribes to status changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Whether the session is open and not shut down.
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    /// Marks the coming end of the connection as expected.
    pub fn set_graceful(&self) {
        self.graceful.store(true, Ordering::Release);
    }

    /// Whether the end of the connection is expected.
    pub fn is_graceful(&self) -> bool {
        self.graceful.load(Ordering::Acquire)
    }

    /// Changes or disables the keep-alive interval.
    pub fn set_keepalive(&self, interval: Option<Duration>) {
        self.keepalive.lock().set_interval(interval);
    }

    /// The single shutdown path. Idempotent.
    ///
    /// Stops the keep-alive, tears down channels and listeners, closes the
    /// writer, stops the reader and publishes the final status.
    pub fn shutdown(&self, error: Option<TernError>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            if let Some(e) = error {
                debug!("Error after shutdown of {}: {}", self.peer, e);
            }
            return;
        }

        self.keepalive.lock().stop();
        self.controller.shutdown();
        self.sender.close();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }

        let exit_status = self.controller.exit_status();
        let status = match error {
            None => SessionStatus::Closed { exit_status },
            Some(e) if self.is_graceful() => {
                debug!("Ignoring error after graceful end of {}: {}", self.peer, e);
                SessionStatus::Closed { exit_status }
            }
            Some(TernError::Disconnected(reason)) if self.opened.load(Ordering::Acquire) => {
                info!("{} disconnected: {}", self.peer, reason);
                SessionStatus::Closed { exit_status }
            }
            Some(e) => {
                logging::log_session_error(&self.peer, &e.to_string());
                SessionStatus::Failed(Arc::new(e))
            }
        };
        let graceful = matches!(status, SessionStatus::Closed { .. });
        logging::log_session_closed(&self.peer, graceful, exit_status);
        self.status.send_replace(status);
        self.collaborators.console.session_closed(exit_status);
    }

    async fn on_open(&self, open: OpenSession) {
        self.controller
            .configure(open.capabilities, open.remote_forwards, open.x11);

        for rule in &self.config.local_forwards {
            if let Err(e) = self.controller.add_local_forward(rule.clone()).await {
                self.collaborators
                    .interactor
                    .report(&format!("Cannot start local forward {}: {}", rule, e));
            }
        }

        let sender = self.sender.clone();
        self.keepalive
            .lock()
            .start(move || sender.send(keepalive_packet()));

        self.opened.store(true, Ordering::Release);
        self.collaborators.console.session_opened(open.cipher.name());
        logging::log_session_open(
            &self.peer,
            open.cipher.name(),
            self.started.elapsed().as_millis() as u64,
        );
        self.status.send_replace(SessionStatus::Open {
            cipher: open.cipher,
        });
    }
}

impl std::fmt::Debug for SessionShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionShared")
            .field("peer", &self.peer)
            .field("status", &*self.status.borrow())
            .field("graceful", &self.is_graceful())
            .finish()
    }
}

/// Starts the session tasks on `stream`.
pub fn start<S>(stream: S, config: SessionConfig, collaborators: Collaborators) -> Arc<SessionShared>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let config = Arc::new(config);
    let (read_half, write_half) = tokio::io::split(stream);
    let (sender, writer) = spawn_writer(write_half);

    let controller = ChannelController::new(
        sender.clone(),
        collaborators.console.clone(),
        collaborators.interactor.clone(),
        Arc::new(HostMap::new()),
        config.connect_timeout,
    );
    let (status, _) = watch::channel(SessionStatus::Connecting);
    let shared = Arc::new(SessionShared {
        peer: config.peer(),
        config: Arc::clone(&config),
        collaborators: collaborators.clone(),
        status,
        graceful: AtomicBool::new(false),
        opened: AtomicBool::new(false),
        closed: AtomicBool::new(false),
        sender: sender.clone(),
        controller,
        keepalive: Mutex::new(KeepaliveTask::new(config.keepalive)),
        reader: Mutex::new(None),
        started: Instant::now(),
    });

    let handshake = Handshake::new(
        Arc::clone(&config),
        collaborators.authenticator,
        collaborators.interactor,
        collaborators.console,
        sender,
    );
    let reader = tokio::spawn(run_reader(read_half, handshake, Arc::clone(&shared)));
    *shared.reader.lock() = Some(reader.abort_handle());

    let watched = Arc::clone(&shared);
    tokio::spawn(async move {
        let mut reader = reader;
        let mut writer = writer;
        let outcome = tokio::select! {
            result = &mut reader => task_outcome("reader", result),
            result = &mut writer => task_outcome("writer", result),
        };
        watched.shutdown(outcome.err());
    });

    shared
}

fn task_outcome(name: &str, result: Result<TernResult<()>, JoinError>) -> TernResult<()> {
    match result {
        Ok(inner) => inner,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(TernError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("Session {} task failed: {}", name, e),
        ))),
    }
}

async fn run_reader<R>(mut reader: R, mut handshake: Handshake, shared: Arc<SessionShared>) -> TernResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = PacketDecoder::new();
    let hello_timeout = shared.config.hello_timeout;
    let line = match tokio::time::timeout(
        hello_timeout,
        read_version_line(&mut reader, &mut decoder),
    )
    .await
    {
        Ok(line) => line?,
        Err(_) => {
            return Err(TernError::Timeout(format!(
                "No identification from {} within {:?}",
                shared.peer, hello_timeout
            )))
        }
    };
    handshake.start(&line)?;

    let mut buf = vec![0u8; READ_CHUNK];
    let mut open = false;
    loop {
        while let Decoded::Complete(packet) = decoder.next()? {
            logging::log_packet_received(packet.msg_type(), packet.payload().len());
            if open {
                if let Received::Exited(status) = shared.controller.receive(packet)? {
                    debug!(status, "Session ending after exit status");
                    shared.set_graceful();
                }
            } else if let Progress::Open(session) = handshake.handle(packet, &mut decoder).await? {
                shared.on_open(session).await;
                open = true;
            }
        }

        let n = reader.read(&mut buf).await?;
        if n == 0 {
            handshake.close();
            if shared.is_graceful() {
                return Ok(());
            }
            return Err(TernError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Connection to {} closed unexpectedly", shared.peer),
            )));
        }
        decoder.feed(&buf[..n]);
    }
}
