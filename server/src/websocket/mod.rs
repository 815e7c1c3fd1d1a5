//! WebSocket support for the change channel.
//!
//! Clients emit their local changes over the socket and receive an
//! acknowledgment for each. Changes persisted by anyone else arrive as
//! `changes.<type>` broadcasts.

mod manager;
mod protocol;

pub use manager::ConnectionManager;
pub use protocol::*;
