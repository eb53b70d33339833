//! rotord - cellular modem IP rotation daemon.
//!
//! Tears the modem's data session down and brings it back up until the
//! carrier hands out a different public IP, while keeping the host's LAN
//! default route intact. Exposes a small HTTP control API and an optional
//! auto-rotation timer.

pub mod config;
pub mod drivers;
pub mod error;
pub mod history;
pub mod middleware;
pub mod modem;
pub mod notifier;
pub mod orchestrator;
pub mod probe;
pub mod reset;
pub mod routes;
pub mod routing;
pub mod scheduler;
pub mod server;
pub mod shell;
pub mod verify;
pub mod wait;

pub use orchestrator::{Collaborators, Orchestrator, OrchestratorState, OutcomeKind, RotationTrigger};
pub use server::AppState;
