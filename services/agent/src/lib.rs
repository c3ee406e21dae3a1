//! Roomlink Agent Library Crate
//!
//! Environment configuration, the WebSocket transport to the room server and
//! the default message and audio collaborators. The `agent` binary wires
//! these into a `roomlink_core::SessionManager`.

pub mod config;
pub mod handlers;
pub mod transport;
