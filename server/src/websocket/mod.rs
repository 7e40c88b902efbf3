//! WebSocket push delivery.
//!
//! Clients connect via WebSocket and receive every harmonic the server
//! confirms, optionally filtered to the collections they subscribe to. The
//! client hands each one to its engine's push entry point.

mod manager;
mod protocol;

pub use manager::ConnectionManager;
pub use protocol::*;
