use std::{net::SocketAddr, time::Duration};

use crate::{nickname::DEFAULT_MAX_NICKNAME_BYTES, transport::DEFAULT_MAX_LINE_BYTES};

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3000";

/// Tunables for [`crate::server::ChatServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    pub listen: SocketAddr,
    /// Connections beyond this many are told the server is full and closed.
    pub max_connections: usize,
    /// Longest accepted line, excluding the terminator.
    pub max_line_bytes: usize,
    pub max_nickname_bytes: usize,
    /// How many invalid nicknames a client may send before it is dropped.
    pub nickname_attempts: usize,
    /// Lines queued per connection before broadcasts start waiting on it.
    pub outbox_capacity: usize,
    /// Bound on a single socket write, and on how long a broadcast waits
    /// for room in one peer's queue.
    pub write_timeout: Duration,
    /// How long a new connection has to settle on a nickname.
    pub registration_timeout: Duration,
    /// How long shutdown waits for connections to finish closing.
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 3000)),
            max_connections: 1024,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            max_nickname_bytes: DEFAULT_MAX_NICKNAME_BYTES,
            nickname_attempts: 3,
            outbox_capacity: 64,
            write_timeout: Duration::from_secs(5),
            registration_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    pub fn with_listen(listen: SocketAddr) -> Self {
        Self {
            listen,
            ..Self::default()
        }
    }
}
