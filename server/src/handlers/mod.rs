//! Request handlers for sync, actions and writes.

mod pull;
mod push;
mod websocket;

pub use pull::*;
pub use push::*;
pub use websocket::handle_websocket_connection;
