//! Structured logging for SSH-1 sessions
//!
//! Provides structured, contextual logging using the `tracing` framework.
//! Handshake, authentication, channel and forwarding events all go through
//! here so their field names stay consistent.
//!
//! # Log Levels
//!
//! - **TRACE**: Individual packets
//! - **DEBUG**: Channel lifecycle, negotiation steps
//! - **INFO**: State transitions, session open/close
//! - **WARN**: Refused negotiation steps, rejected forwards
//! - **ERROR**: Fatal session errors
//!
//! # Example
//!
//! ```no_run
//! use tern_proto::ssh1::logging;
//!
//! tracing_subscriber::fmt()
//!     .with_env_filter("tern_proto::ssh1=debug")
//!     .init();
//!
//! logging::log_state_transition("example.org:22", "KeysSent", "UserSent");
//! ```

use crate::ssh1::message;
use tracing::{debug, error, info, trace, warn};

/// Log a handshake state transition
///
/// # Arguments
///
/// * `peer` - Remote `host:port`
/// * `old_state` - Previous state
/// * `new_state` - New state
pub fn log_state_transition(peer: &str, old_state: &str, new_state: &str) {
    info!(
        peer = peer,
        state_from = old_state,
        state_to = new_state,
        "Handshake state transition"
    );
}

/// Log a packet handed to the writer
pub fn log_packet_sent(msg_type: u8, payload_len: usize) {
    trace!(
        msg = %message::describe(msg_type),
        payload_len = payload_len,
        "Packet queued"
    );
}

/// Log a packet taken from the decoder
pub fn log_packet_received(msg_type: u8, payload_len: usize) {
    trace!(
        msg = %message::describe(msg_type),
        payload_len = payload_len,
        "Packet received"
    );
}

/// Log the start of an authentication method
pub fn log_auth_attempt(method: &str) {
    debug!(method = method, "Trying authentication method");
}

/// Log an authentication method that did not succeed
pub fn log_auth_failed(method: &str, reason: &str) {
    warn!(method = method, reason = reason, "Authentication method failed");
}

/// Log a negotiation step the server refused
pub fn log_negotiation_refused(step: &str) {
    warn!(step = step, "Server refused negotiation step");
}

/// Log the session becoming usable
///
/// # Arguments
///
/// * `peer` - Remote `host:port`
/// * `cipher` - Negotiated cipher name
/// * `duration_ms` - Time from connect to open
pub fn log_session_open(peer: &str, cipher: &str, duration_ms: u64) {
    info!(
        peer = peer,
        cipher = cipher,
        duration_ms = duration_ms,
        "Session open"
    );
}

/// Log session teardown
pub fn log_session_closed(peer: &str, graceful: bool, exit_status: Option<u32>) {
    info!(
        peer = peer,
        graceful = graceful,
        exit_status = ?exit_status,
        "Session closed"
    );
}

/// Log a fatal session error
pub fn log_session_error(peer: &str, error: &str) {
    error!(peer = peer, error = error, "Session failed");
}

/// Log a channel lifecycle event
///
/// # Arguments
///
/// * `local_id` - Our channel number
/// * `remote_id` - Server's channel number, once known
/// * `event` - What happened ("open", "confirmed", "close", ...)
pub fn log_channel_event(local_id: u32, remote_id: Option<u32>, event: &str) {
    debug!(
        local_channel = local_id,
        remote_channel = ?remote_id,
        event = event,
        "Channel event"
    );
}

/// Log a forwarded connection being set up
pub fn log_forward_open(direction: &str, target: &str) {
    debug!(direction = direction, target = target, "Forwarded connection");
}

/// Log a forwarded connection that could not be made
pub fn log_forward_failed(direction: &str, target: &str, error: &str) {
    warn!(
        direction = direction,
        target = target,
        error = error,
        "Forwarded connection failed"
    );
}
