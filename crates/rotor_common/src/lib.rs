//! Rotor Common - shared types for the rotor daemon and CLI.
//!
//! Configuration, control API payloads, the persisted IP history and
//! the error types both sides agree on.

pub mod api;
pub mod config;
pub mod error;
pub mod history;
pub mod mode;

pub use api::*;
pub use config::*;
pub use error::*;
pub use history::*;
pub use mode::*;

/// Crate version, reported by `/status` and `rotorctl --version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
