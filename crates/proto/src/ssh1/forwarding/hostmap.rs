//! Host/port rewrite table for inbound connect requests.
//!
//! When the server asks the client to open a connection (`MSG_PORT_OPEN` or
//! `SMSG_X11_OPEN`), the requested target is first looked up here. Entries
//! are either permanent or one-shot; a one-shot entry is removed by the
//! first request it matches, so a second identical request goes to the
//! literal target.
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh1::forwarding::{ForwardAddr, HostMap};
//!
//! let map = HostMap::new();
//! map.add_temporary(ForwardAddr::new("internal", 80), ForwardAddr::new("10.0.0.5", 8080));
//!
//! let requested = ForwardAddr::new("internal", 80);
//! assert_eq!(map.resolve(&requested), ForwardAddr::new("10.0.0.5", 8080));
//! assert_eq!(map.resolve(&requested), requested);
//! ```

use super::types::ForwardAddr;
use parking_lot::Mutex;
use std::collections::HashMap;
use tern_platform::{TernError, TernResult};
use tracing::debug;

/// First TCP port of the X11 display range.
pub const X11_BASE_PORT: u16 = 6000;

#[derive(Debug, Default)]
struct Entries {
    permanent: HashMap<ForwardAddr, ForwardAddr>,
    temporary: HashMap<ForwardAddr, ForwardAddr>,
}

/// Shared rewrite table.
#[derive(Debug, Default)]
pub struct HostMap {
    entries: Mutex<Entries>,
}

impl HostMap {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rewrite that stays until removed.
    pub fn add_permanent(&self, from: ForwardAddr, to: ForwardAddr) {
        self.entries.lock().permanent.insert(from, to);
    }

    /// Adds a rewrite that is used once.
    pub fn add_temporary(&self, from: ForwardAddr, to: ForwardAddr) {
        self.entries.lock().temporary.insert(from, to);
    }

    /// Removes both kinds of entry for `from`.
    pub fn remove(&self, from: &ForwardAddr) {
        let mut entries = self.entries.lock();
        entries.permanent.remove(from);
        entries.temporary.remove(from);
    }

    /// Number of entries of both kinds.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock();
        entries.permanent.len() + entries.temporary.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrites a requested target. One-shot entries win over permanent
    /// ones and are consumed.
    pub fn resolve(&self, requested: &ForwardAddr) -> ForwardAddr {
        let mut entries = self.entries.lock();
        if let Some(to) = entries.temporary.remove(requested) {
            debug!(from = %requested, to = %to, "Consumed one-shot host mapping");
            return to;
        }
        if let Some(to) = entries.permanent.get(requested) {
            debug!(from = %requested, to = %to, "Applied host mapping");
            return to.clone();
        }
        requested.clone()
    }
}

/// Parsed X11 display string (`[host]:display[.screen]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X11Display {
    /// Host running the X server; empty means local.
    pub host: String,
    /// Display number.
    pub display: u16,
    /// Screen number.
    pub screen: u32,
}

impl X11Display {
    /// Parses a display string.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Config`] if the string has no display number or
    /// the resulting port would overflow.
    pub fn parse(display: &str) -> TernResult<Self> {
        let bad = || TernError::Config(format!("Invalid X11 display '{}'", display));
        let (host, rest) = display.rsplit_once(':').ok_or_else(bad)?;
        let (number, screen) = match rest.split_once('.') {
            Some((number, screen)) => (number, screen.parse::<u32>().map_err(|_| bad())?),
            None => (rest, 0),
        };
        let number = number.parse::<u16>().map_err(|_| bad())?;
        if number > u16::MAX - X11_BASE_PORT {
            return Err(bad());
        }
        Ok(Self {
            host: host.to_string(),
            display: number,
            screen,
        })
    }

    /// Where X11 connections for this display go.
    pub fn target(&self) -> ForwardAddr {
        let host = if self.host.is_empty() || self.host == "unix" {
            "127.0.0.1"
        } else {
            self.host.as_str()
        };
        ForwardAddr::new(host, X11_BASE_PORT + self.display)
    }
}
