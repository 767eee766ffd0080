//! # Tern Platform
//!
//! Core platform types and collaborator traits for the Tern SSH-1 client.
//!
//! This crate provides:
//! - Unified error types (`TernError`, `TernResult`)
//! - Collaborator traits (`Interactor`, `Authenticator`, `Console`) that the
//!   protocol core calls into instead of doing any UI itself
//!
//! # Examples
//!
//! ```
//! use tern_platform::{TernError, TernResult};
//!
//! fn example_function() -> TernResult<String> {
//!     Ok("Hello, Tern!".to_string())
//! }
//!
//! # fn main() -> TernResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Tern!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod traits;

pub use error::{TernError, TernResult};
pub use traits::{Authenticator, Console, HostKeyInfo, IdentityMaterial, Interactor, TerminalSize};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
