use std::io::Write;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use line_chat::{
    cli::{Cli, Command},
    client,
    config::ServerConfig,
    server::ChatServer,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    // Logs go to stderr; stdout carries the chat transcript.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let server = ChatServer::bind(ServerConfig::from(args)).await?;
            let addr = server.local_addr()?;
            info!(%addr, "server started");

            let mut stdout = std::io::stdout();
            writeln!(stdout, "server listening on {addr}")?;
            stdout.flush()?;

            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
