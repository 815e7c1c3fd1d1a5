//! Request handlers shared by the HTTP routes and the WebSocket channel.

mod change;
mod snapshot;
pub mod websocket;

pub use change::*;
pub use snapshot::*;
