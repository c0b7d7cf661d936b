//! Multi-user chat over newline-delimited TCP.
//!
//! The first line a client sends is its nickname; every line after that is
//! relayed verbatim to every other connected client. Each module focuses on
//! one responsibility:
//!
//! - [`transport`] frames UTF-8 lines over async byte streams, with a cap on
//!   line length.
//! - [`nickname`] validates client-chosen nicknames.
//! - [`registry`] is the shared nickname → connection map: atomic
//!   registration, idempotent removal, and fan-out broadcast that drops
//!   peers which cannot keep up.
//! - [`connection`] runs one connection through registration, relay, and
//!   teardown.
//! - [`server`] owns the listener and spawns a task per connection.
//! - [`client`] connects a terminal to a server.
//! - [`cli`] and [`config`] describe how both are configured.
//!
//! Broadcast is global. Rooms are not implemented; the registry keeps its map
//! private so a room index can be added behind the same operations.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod nickname;
pub mod registry;
pub mod server;
pub mod transport;
