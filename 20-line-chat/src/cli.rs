use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    config::{DEFAULT_LISTEN_ADDR, ServerConfig},
    nickname::DEFAULT_MAX_NICKNAME_BYTES,
    transport::DEFAULT_MAX_LINE_BYTES,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server, relaying lines between connected clients.
    Server(ServerArgs),
    /// Connect to a server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, env = "LINE_CHAT_LISTEN", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: SocketAddr,

    /// Maximum number of simultaneous connections.
    #[arg(long, env = "LINE_CHAT_MAX_CONNECTIONS", default_value_t = 1024)]
    pub max_connections: usize,

    /// Longest accepted line in bytes.
    #[arg(long, env = "LINE_CHAT_MAX_LINE_BYTES", default_value_t = DEFAULT_MAX_LINE_BYTES)]
    pub max_line_bytes: usize,

    /// Longest accepted nickname in bytes.
    #[arg(long, env = "LINE_CHAT_MAX_NICKNAME_BYTES", default_value_t = DEFAULT_MAX_NICKNAME_BYTES)]
    pub max_nickname_bytes: usize,

    /// Invalid nicknames a client may send before being disconnected.
    #[arg(long, env = "LINE_CHAT_NICKNAME_ATTEMPTS", default_value_t = 3)]
    pub nickname_attempts: usize,

    /// Lines buffered per client before it counts as slow.
    #[arg(long, env = "LINE_CHAT_OUTBOX_CAPACITY", default_value_t = 64)]
    pub outbox_capacity: usize,

    /// Milliseconds a write to one client may take before it is disconnected.
    #[arg(long, env = "LINE_CHAT_WRITE_TIMEOUT_MS", default_value_t = 5_000)]
    pub write_timeout_ms: u64,

    /// Milliseconds a new client has to register a nickname.
    #[arg(long, env = "LINE_CHAT_REGISTRATION_TIMEOUT_MS", default_value_t = 30_000)]
    pub registration_timeout_ms: u64,

    /// Milliseconds shutdown waits for open connections to close.
    #[arg(long, env = "LINE_CHAT_DRAIN_TIMEOUT_MS", default_value_t = 5_000)]
    pub drain_timeout_ms: u64,
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        ServerConfig {
            listen: args.listen,
            max_connections: args.max_connections,
            max_line_bytes: args.max_line_bytes,
            max_nickname_bytes: args.max_nickname_bytes,
            nickname_attempts: args.nickname_attempts,
            outbox_capacity: args.outbox_capacity,
            write_timeout: Duration::from_millis(args.write_timeout_ms),
            registration_timeout: Duration::from_millis(args.registration_timeout_ms),
            drain_timeout: Duration::from_millis(args.drain_timeout_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the server to connect to.
    #[arg(long, env = "LINE_CHAT_SERVER", default_value = DEFAULT_LISTEN_ADDR)]
    pub server: SocketAddr,

    /// Nickname to register with. Prompted for on stdin when omitted.
    #[arg(long)]
    pub nickname: Option<String>,
}
