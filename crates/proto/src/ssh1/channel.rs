//! Post-handshake channel multiplexing.
//!
//! SSH-1 has one implicit interactive stream (`STDIN`/`STDOUT`/`STDERR`
//! messages, no channel number) plus numbered channels for forwarded TCP
//! and X11 connections. The [`ChannelController`] owns the channel table,
//! routes every inbound packet of an open session and sends the replies.
//!
//! # Channel lifecycle
//!
//! ```text
//! Opening --OPEN_CONFIRMATION--> Open --local EOF / close_channel--> Closing
//!    |                            |                                    |
//!    +--OPEN_FAILURE--> (gone)    +--CHANNEL_CLOSE--> (gone)            +--CLOSE_CONFIRMATION--> (gone)
//!    |
//!    +--close_channel--> Cancelled --OPEN_CONFIRMATION--> Closing
//!                           |
//!                           +--OPEN_FAILURE--> (gone)
//! ```
//!
//! A channel closed before the server answered its open keeps its number
//! until that answer arrives, so a late confirmation is closed again rather
//! than treated as a protocol error.
//!
//! When the server closes a channel it is answered with
//! `MSG_CHANNEL_CLOSE_CONFIRMATION`; when the local socket ends first the
//! client sends `MSG_CHANNEL_CLOSE` and waits for the confirmation.
//!
//! # Ordering
//!
//! For inbound opens the confirmation is queued and flushed on the session
//! writer before the socket pump starts, so the server always learns about
//! the channel before it sees data on it.

use crate::ssh1::codec::check_disconnect;
use crate::ssh1::forwarding::{
    connect_target, ForwardAddr, ForwardRule, HostMap, LocalForward, RemoteForwards, X11Display,
};
use crate::ssh1::kex::Capabilities;
use crate::ssh1::logging;
use crate::ssh1::message::{self, MessageType};
use crate::ssh1::packet::Packet;
use crate::ssh1::transport::PacketSender;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tern_platform::{Console, Interactor, TernError, TernResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Read size for forwarded sockets.
pub const PUMP_CHUNK: usize = 16 * 1024;

/// What a numbered channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Outbound connection opened for a server `MSG_PORT_OPEN`.
    Connect,
    /// Connection accepted on a local forward.
    Listen,
    /// Outbound connection to the local X server.
    X11,
}

impl ChannelKind {
    fn direction(self) -> &'static str {
        match self {
            ChannelKind::Connect => "remote",
            ChannelKind::Listen => "local",
            ChannelKind::X11 => "x11",
        }
    }
}

/// Where a channel is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Open requested, no answer yet.
    Opening,
    /// Carrying data.
    Open,
    /// Close sent, waiting for the confirmation.
    Closing,
    /// Closed locally while still opening; waiting for the server's answer.
    Cancelled,
}

/// Snapshot of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Our channel number.
    pub local_id: u32,
    /// Server's channel number.
    pub remote_id: Option<u32>,
    /// Channel variant.
    pub kind: ChannelKind,
    /// Lifecycle state.
    pub state: ChannelState,
    /// Target or peer, for display.
    pub description: String,
}

/// Outcome of routing one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// Nothing for the session to do.
    Handled,
    /// The remote command exited with this status.
    Exited(u32),
}

struct ChannelEntry {
    kind: ChannelKind,
    remote_id: Option<u32>,
    state: ChannelState,
    description: String,
    pending_stream: Option<TcpStream>,
    to_socket: Option<mpsc::UnboundedSender<Bytes>>,
    pump: Option<JoinHandle<()>>,
}

impl ChannelEntry {
    fn new(kind: ChannelKind, description: String) -> Self {
        Self {
            kind,
            remote_id: None,
            state: ChannelState::Opening,
            description,
            pending_stream: None,
            to_socket: None,
            pump: None,
        }
    }

    fn stop_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        // Dropping the queue lets the socket writer drain and shut down.
        self.to_socket = None;
        self.pending_stream = None;
    }
}

#[derive(Default)]
struct ChannelTable {
    next_id: u32,
    channels: HashMap<u32, ChannelEntry>,
}

impl ChannelTable {
    fn allocate(&mut self, entry: ChannelEntry) -> u32 {
        while self.channels.contains_key(&self.next_id) {
            self.next_id = self.next_id.wrapping_add(1);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.channels.insert(id, entry);
        id
    }
}

#[derive(Default)]
struct ForwardSetup {
    capabilities: Capabilities,
    remote: RemoteForwards,
    x11: Option<X11Display>,
}

/// Routes packets of an open session and owns all numbered channels.
pub struct ChannelController {
    sender: PacketSender,
    console: Arc<dyn Console>,
    interactor: Arc<dyn Interactor>,
    host_map: Arc<HostMap>,
    connect_timeout: Duration,
    table: Mutex<ChannelTable>,
    setup: Mutex<ForwardSetup>,
    listeners: Mutex<HashMap<ForwardAddr, (SocketAddr, JoinHandle<()>)>>,
    exit_status: Mutex<Option<u32>>,
}

fn unknown_channel(local_id: u32, msg_type: u8) -> TernError {
    TernError::Protocol(format!(
        "{} for unknown channel {}",
        message::describe(msg_type),
        local_id
    ))
}

fn open_failure(remote_id: u32) -> Packet {
    let mut packet = Packet::new(MessageType::ChannelOpenFailure);
    packet.put_u32(remote_id);
    packet
}

impl ChannelController {
    /// Creates a controller that sends through `sender`.
    pub fn new(
        sender: PacketSender,
        console: Arc<dyn Console>,
        interactor: Arc<dyn Interactor>,
        host_map: Arc<HostMap>,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            sender,
            console,
            interactor,
            host_map,
            connect_timeout,
            table: Mutex::new(ChannelTable::default()),
            setup: Mutex::new(ForwardSetup::default()),
            listeners: Mutex::new(HashMap::new()),
            exit_status: Mutex::new(None),
        })
    }

    /// Installs what the handshake negotiated.
    pub fn configure(
        &self,
        capabilities: Capabilities,
        remote: RemoteForwards,
        x11: Option<X11Display>,
    ) {
        let mut setup = self.setup.lock();
        setup.capabilities = capabilities;
        setup.remote = remote;
        setup.x11 = x11;
    }

    /// The rewrite table consulted for inbound opens.
    pub fn host_map(&self) -> &Arc<HostMap> {
        &self.host_map
    }

    /// Exit status, once the remote command has finished.
    pub fn exit_status(&self) -> Option<u32> {
        *self.exit_status.lock()
    }

    /// Allocates a channel number for a new `Opening` channel. Allocation
    /// and insertion happen under one lock.
    ///
    /// Every numbered channel starts here. The caller sends the open
    /// request (or the confirmation for a server-initiated open); the
    /// channel becomes `Open` once the server confirms it.
    pub fn open_channel(&self, kind: ChannelKind, description: impl Into<String>) -> u32 {
        let id = self
            .table
            .lock()
            .allocate(ChannelEntry::new(kind, description.into()));
        logging::log_channel_event(id, None, "allocated");
        id
    }

    /// Queues a packet on the session writer.
    pub fn transmit(&self, packet: Packet) -> TernResult<()> {
        self.sender.send(packet)
    }

    /// Current channels.
    pub fn channels(&self) -> Vec<ChannelInfo> {
        let table = self.table.lock();
        let mut list: Vec<ChannelInfo> = table
            .channels
            .iter()
            .map(|(&local_id, entry)| ChannelInfo {
                local_id,
                remote_id: entry.remote_id,
                kind: entry.kind,
                state: entry.state,
                description: entry.description.clone(),
            })
            .collect();
        list.sort_by_key(|info| info.local_id);
        list
    }

    /// Starts closing a channel: sends `MSG_CHANNEL_CLOSE` and stops
    /// reading from its socket.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Protocol`] if the channel does not exist.
    pub fn close_channel(&self, local_id: u32) -> TernResult<()> {
        let mut table = self.table.lock();
        let entry = table.channels.get_mut(&local_id).ok_or_else(|| {
            TernError::Protocol(format!("Cannot close unknown channel {}", local_id))
        })?;
        if let Some(pump) = entry.pump.take() {
            pump.abort();
        }
        match (entry.state, entry.remote_id) {
            (ChannelState::Open, Some(remote_id)) => {
                entry.state = ChannelState::Closing;
                logging::log_channel_event(local_id, Some(remote_id), "close");
                self.sender.send(close_packet(MessageType::ChannelClose, remote_id))
            }
            (ChannelState::Opening, _) => {
                // Keep the number until the server answers the open.
                entry.state = ChannelState::Cancelled;
                entry.pending_stream = None;
                logging::log_channel_event(local_id, None, "cancelled while opening");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Routes one inbound packet.
    ///
    /// # Errors
    ///
    /// - [`TernError::Disconnected`] for `MSG_DISCONNECT`
    /// - [`TernError::Protocol`] for unknown channel numbers, malformed
    ///   payloads or messages that do not belong to an open session
    pub fn receive(self: &Arc<Self>, packet: Packet) -> TernResult<Received> {
        check_disconnect(&packet)?;
        let mut reader = packet.reader();
        match packet.message() {
            Some(MessageType::StdoutData) => {
                self.console.write_output(reader.get_string()?);
            }
            Some(MessageType::StderrData) => {
                self.console.write_error(reader.get_string()?);
            }
            Some(MessageType::ExitStatus) => {
                let status = reader.get_u32()?;
                *self.exit_status.lock() = Some(status);
                self.sender.send(Packet::new(MessageType::ExitConfirmation))?;
                debug!(status, "Remote command exited");
                return Ok(Received::Exited(status));
            }
            Some(MessageType::ChannelOpenConfirmation) => {
                let local_id = reader.get_u32()?;
                let remote_id = reader.get_u32()?;
                self.confirmed(local_id, remote_id, packet.msg_type())?;
            }
            Some(MessageType::ChannelOpenFailure) => {
                let local_id = reader.get_u32()?;
                let entry = self
                    .table
                    .lock()
                    .channels
                    .remove(&local_id)
                    .ok_or_else(|| unknown_channel(local_id, packet.msg_type()))?;
                if entry.state == ChannelState::Cancelled {
                    logging::log_channel_event(local_id, None, "open refused after cancel");
                } else {
                    logging::log_forward_failed(
                        entry.kind.direction(),
                        &entry.description,
                        "refused by server",
                    );
                }
            }
            Some(MessageType::ChannelData) => {
                let local_id = reader.get_u32()?;
                let data = Bytes::copy_from_slice(reader.get_string()?);
                self.channel_data(local_id, data, packet.msg_type())?;
            }
            Some(MessageType::ChannelClose) => {
                let local_id = reader.get_u32()?;
                let mut entry = self
                    .table
                    .lock()
                    .channels
                    .remove(&local_id)
                    .ok_or_else(|| unknown_channel(local_id, packet.msg_type()))?;
                entry.stop_pump();
                logging::log_channel_event(local_id, entry.remote_id, "closed by server");
                if let Some(remote_id) = entry.remote_id {
                    self.sender
                        .send(close_packet(MessageType::ChannelCloseConfirmation, remote_id))?;
                }
            }
            Some(MessageType::ChannelCloseConfirmation) => {
                let local_id = reader.get_u32()?;
                let mut entry = self
                    .table
                    .lock()
                    .channels
                    .remove(&local_id)
                    .ok_or_else(|| unknown_channel(local_id, packet.msg_type()))?;
                entry.stop_pump();
                logging::log_channel_event(local_id, entry.remote_id, "close confirmed");
            }
            Some(MessageType::PortOpen) => {
                let remote_id = reader.get_u32()?;
                let host = reader.get_text()?;
                let port = reader.get_u32()?;
                let requested = u16::try_from(port)
                    .ok()
                    .map(|port| ForwardAddr::new(host.clone(), port))
                    .filter(|requested| self.setup.lock().remote.find(requested).is_some());
                match requested {
                    Some(requested) => {
                        self.spawn_connect(remote_id, requested, ChannelKind::Connect)
                    }
                    None => {
                        self.interactor.report(&format!(
                            "Refused connection to {}:{} requested by the server: no matching remote forward",
                            host, port
                        ));
                        self.sender.send(open_failure(remote_id))?;
                    }
                }
            }
            Some(MessageType::X11Open) => {
                let remote_id = reader.get_u32()?;
                let target = self.setup.lock().x11.as_ref().map(X11Display::target);
                match target {
                    Some(target) => self.spawn_connect(remote_id, target, ChannelKind::X11),
                    None => {
                        self.interactor
                            .report("Refused X11 connection: X11 forwarding is not enabled");
                        self.sender.send(open_failure(remote_id))?;
                    }
                }
            }
            Some(MessageType::AgentOpen) => {
                let remote_id = reader.get_u32()?;
                self.interactor
                    .report("Refused agent connection: agent forwarding is not supported");
                self.sender.send(open_failure(remote_id))?;
            }
            Some(MessageType::Success) | Some(MessageType::Failure) => {
                debug!(msg = %message::describe(packet.msg_type()), "Stray reply in open session");
            }
            _ => {
                return Err(TernError::Protocol(format!(
                    "Unexpected {} in open session",
                    message::describe(packet.msg_type())
                )));
            }
        }
        Ok(Received::Handled)
    }

    fn channel_data(&self, local_id: u32, data: Bytes, msg_type: u8) -> TernResult<()> {
        let mut table = self.table.lock();
        let entry = table
            .channels
            .get_mut(&local_id)
            .ok_or_else(|| unknown_channel(local_id, msg_type))?;
        trace!(channel = local_id, bytes = data.len(), "Channel data");
        match (entry.state, entry.remote_id) {
            (ChannelState::Open, Some(remote_id)) => {
                let Some(to_socket) = &entry.to_socket else {
                    debug!(channel = local_id, bytes = data.len(), "No socket yet, data dropped");
                    return Ok(());
                };
                if to_socket.send(data).is_err() {
                    // Socket writer is gone.
                    entry.stop_pump();
                    entry.state = ChannelState::Closing;
                    logging::log_channel_event(local_id, Some(remote_id), "socket gone");
                    return self
                        .sender
                        .send(close_packet(MessageType::ChannelClose, remote_id));
                }
                Ok(())
            }
            (ChannelState::Closing, _) => {
                debug!(channel = local_id, bytes = data.len(), "Data for closing channel dropped");
                Ok(())
            }
            (state, _) => Err(TernError::Protocol(format!(
                "{} for channel {} in state {:?}",
                message::describe(msg_type),
                local_id,
                state
            ))),
        }
    }

    fn confirmed(self: &Arc<Self>, local_id: u32, remote_id: u32, msg_type: u8) -> TernResult<()> {
        let stream = {
            let mut table = self.table.lock();
            let entry = table
                .channels
                .get_mut(&local_id)
                .ok_or_else(|| unknown_channel(local_id, msg_type))?;
            match entry.state {
                ChannelState::Opening => {}
                ChannelState::Cancelled => {
                    entry.remote_id = Some(remote_id);
                    entry.state = ChannelState::Closing;
                    logging::log_channel_event(local_id, Some(remote_id), "confirmed after cancel");
                    return self
                        .sender
                        .send(close_packet(MessageType::ChannelClose, remote_id));
                }
                ChannelState::Open | ChannelState::Closing => {
                    return Err(TernError::Protocol(format!(
                        "Channel {} confirmed twice",
                        local_id
                    )));
                }
            }
            entry.remote_id = Some(remote_id);
            entry.state = ChannelState::Open;
            entry.pending_stream.take()
        };
        logging::log_channel_event(local_id, Some(remote_id), "confirmed");
        if let Some(stream) = stream {
            self.start_pump(local_id, remote_id, stream);
        }
        Ok(())
    }

    /// Registers a socket accepted on a local forward and asks the server
    /// to open `target` for it. The socket is pumped once the server
    /// confirms.
    pub fn open_listen_channel(
        self: &Arc<Self>,
        stream: TcpStream,
        target: &ForwardAddr,
        originator: &str,
    ) -> TernResult<u32> {
        let local_id = self.open_channel(ChannelKind::Listen, target.to_string());
        // Attached before the request goes out, so the confirmation finds it.
        if let Some(entry) = self.table.lock().channels.get_mut(&local_id) {
            entry.pending_stream = Some(stream);
        }

        let mut packet = Packet::new(MessageType::PortOpen);
        packet
            .put_u32(local_id)
            .put_string(target.host.as_bytes())
            .put_u32(u32::from(target.port));
        if self.setup.lock().capabilities.host_in_fwd_open {
            packet.put_string(originator.as_bytes());
        }
        logging::log_forward_open("local", &target.to_string());
        if let Err(e) = self.sender.send(packet) {
            self.table.lock().channels.remove(&local_id);
            return Err(e);
        }
        Ok(local_id)
    }

    fn spawn_connect(self: &Arc<Self>, remote_id: u32, requested: ForwardAddr, kind: ChannelKind) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let target = controller.host_map.resolve(&requested);
            match connect_target(&target, controller.connect_timeout).await {
                Ok(stream) => {
                    if let Err(e) = controller.accept_inbound(remote_id, kind, &target, stream).await
                    {
                        debug!("Could not confirm channel for {}: {}", target, e);
                    }
                }
                Err(e) => {
                    logging::log_forward_failed(kind.direction(), &target.to_string(), &e.to_string());
                    let _ = controller.sender.send(open_failure(remote_id));
                }
            }
        });
    }

    async fn accept_inbound(
        self: &Arc<Self>,
        remote_id: u32,
        kind: ChannelKind,
        target: &ForwardAddr,
        stream: TcpStream,
    ) -> TernResult<()> {
        let local_id = self.open_channel(kind, target.to_string());
        let (read_half, write_half) = stream.into_split();
        // The socket writer exists before the server can send data.
        self.attach_writer(local_id, write_half);
        if let Some(entry) = self.table.lock().channels.get_mut(&local_id) {
            entry.remote_id = Some(remote_id);
            entry.state = ChannelState::Open;
        }

        let mut confirmation = Packet::new(MessageType::ChannelOpenConfirmation);
        confirmation.put_u32(remote_id).put_u32(local_id);
        self.sender.send(confirmation)?;
        self.sender.flush().await?;

        logging::log_forward_open(kind.direction(), &target.to_string());
        self.start_reader(local_id, remote_id, read_half);
        Ok(())
    }

    fn start_pump(self: &Arc<Self>, local_id: u32, remote_id: u32, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        self.attach_writer(local_id, write_half);
        self.start_reader(local_id, remote_id, read_half);
    }

    /// Spawns the task writing server data to the socket.
    fn attach_writer(&self, local_id: u32, mut write_half: OwnedWriteHalf) {
        let (to_socket, mut from_server) = mpsc::unbounded_channel::<Bytes>();
        tokio::spawn(async move {
            while let Some(data) = from_server.recv().await {
                if write_half.write_all(&data).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });
        if let Some(entry) = self.table.lock().channels.get_mut(&local_id) {
            entry.to_socket = Some(to_socket);
        }
    }

    /// Spawns the pump turning socket reads into `MSG_CHANNEL_DATA`.
    fn start_reader(self: &Arc<Self>, local_id: u32, remote_id: u32, mut read_half: OwnedReadHalf) {
        let controller = Arc::clone(self);
        let sender = self.sender.clone();
        let pump = tokio::spawn(async move {
            let mut buf = vec![0u8; PUMP_CHUNK];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut packet = Packet::new(MessageType::ChannelData);
                        packet.put_u32(remote_id).put_string(&buf[..n]);
                        if sender.send(packet).is_err() {
                            return;
                        }
                    }
                }
            }
            controller.local_eof(local_id);
        });

        let mut table = self.table.lock();
        match table.channels.get_mut(&local_id) {
            Some(entry) => entry.pump = Some(pump),
            None => pump.abort(),
        }
    }

    fn local_eof(&self, local_id: u32) {
        let mut table = self.table.lock();
        if let Some(entry) = table.channels.get_mut(&local_id) {
            entry.pump = None;
            if let (ChannelState::Open, Some(remote_id)) = (entry.state, entry.remote_id) {
                entry.state = ChannelState::Closing;
                logging::log_channel_event(local_id, Some(remote_id), "local end closed");
                let _ = self
                    .sender
                    .send(close_packet(MessageType::ChannelClose, remote_id));
            }
        }
    }

    /// Binds a local forward and starts accepting on it.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Io`] if the address cannot be bound and
    /// [`TernError::Config`] if a forward with the same bind address exists.
    pub async fn add_local_forward(self: &Arc<Self>, rule: ForwardRule) -> TernResult<SocketAddr> {
        if self.listeners.lock().contains_key(&rule.bind) {
            return Err(TernError::Config(format!(
                "A local forward on {} already exists",
                rule.bind
            )));
        }
        let bind = rule.bind.clone();
        let forward = LocalForward::bind(rule).await?;
        let local_addr = forward.local_addr();
        let handle = forward.spawn(Arc::clone(self));
        self.listeners.lock().insert(bind, (local_addr, handle));
        Ok(local_addr)
    }

    /// Stops a local forward. Connections already open stay open.
    pub fn remove_local_forward(&self, bind: &ForwardAddr) -> bool {
        match self.listeners.lock().remove(bind) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Addresses of the active local forwards.
    pub fn local_forwards(&self) -> Vec<SocketAddr> {
        self.listeners.lock().values().map(|(addr, _)| *addr).collect()
    }

    /// Kills every listener and every forwarded connection.
    pub fn shutdown(&self) {
        for (_, (_, handle)) in self.listeners.lock().drain() {
            handle.abort();
        }
        let mut table = self.table.lock();
        for (local_id, mut entry) in table.channels.drain() {
            entry.stop_pump();
            logging::log_channel_event(local_id, entry.remote_id, "torn down");
        }
    }
}

fn close_packet(msg_type: MessageType, remote_id: u32) -> Packet {
    let mut packet = Packet::new(msg_type);
    packet.put_u32(remote_id);
    packet
}

impl std::fmt::Debug for ChannelController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelController")
            .field("channels", &self.table.lock().channels.len())
            .field("listeners", &self.listeners.lock().len())
            .field("exit_status", &*self.exit_status.lock())
            .finish()
    }
}
