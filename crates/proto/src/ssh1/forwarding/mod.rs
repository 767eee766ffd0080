//! SSH-1 port forwarding
//!
//! This module implements forwarding in both directions:
//! - **Local Forward**: a local listener whose connections are opened on the
//!   server side with `MSG_PORT_OPEN`
//! - **Remote Forward**: the server listens and asks the client to connect
//!   to a target; X11 connections take the same path with a target derived
//!   from the display string
//!
//! Inbound targets pass through the [`HostMap`] rewrite table first.
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh1::forwarding::parse_forward_rule;
//!
//! let rule = parse_forward_rule("127.0.0.1:8080:database.internal:3306").unwrap();
//! assert_eq!(rule.bind.port, 8080);
//! assert_eq!(rule.target.host, "database.internal");
//! ```

pub mod hostmap;
pub mod local;
pub mod remote;
pub mod types;

pub use hostmap::{HostMap, X11Display};
pub use local::LocalForward;
pub use remote::{connect_target, port_forward_request, RemoteForwards};
pub use types::{parse_forward_addr, parse_forward_rule, ForwardAddr, ForwardRule};
