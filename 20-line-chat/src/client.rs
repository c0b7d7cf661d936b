//! Terminal client: stdin lines go to the server, server lines go to stdout.
//!
//! The two directions run as separate tasks and only meet at teardown, so a
//! quiet server never holds up typing and a slow terminal never holds up
//! the socket.

use std::io::BufRead;

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncRead, AsyncWrite, BufReader},
    net::TcpStream,
    select,
    sync::mpsc,
};
use tracing::{debug, info};

use crate::{
    cli::ClientArgs,
    transport::{LineReader, LineWriter},
};

pub const USERNAME_PROMPT: &str = "Enter the username:";

pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    let input = spawn_stdin_reader();
    run_session(reader, writer, input, tokio::io::stdout(), args.nickname).await
}

/// Reads stdin on a plain thread so a pending read never keeps the runtime
/// alive after the server has gone away.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Pumps `input` to the server and server lines to `output` until the server
/// closes the connection, or until input ends and the server then closes.
pub async fn run_session<R, W, O>(
    server_reader: R,
    server_writer: W,
    input: mpsc::Receiver<String>,
    output: O,
    nickname: Option<String>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    O: AsyncWrite + Unpin + Send + 'static,
{
    let mut output = LineWriter::new(output);
    if nickname.is_none() {
        output.write_line(USERNAME_PROMPT).await?;
    }

    let mut outgoing = tokio::spawn(forward_input(
        input,
        LineWriter::new(server_writer),
        nickname,
    ));
    let mut incoming = tokio::spawn(forward_output(
        LineReader::new(BufReader::new(server_reader)),
        output,
    ));

    select! {
        result = &mut incoming => {
            outgoing.abort();
            result.context("server reader task panicked")??;
            debug!("server closed the connection");
        }
        result = &mut outgoing => {
            result.context("input task panicked")??;
            debug!("input closed, waiting for server to hang up");
            incoming.await.context("server reader task panicked")??;
        }
    }

    Ok(())
}

async fn forward_input<W>(
    mut input: mpsc::Receiver<String>,
    mut writer: LineWriter<W>,
    nickname: Option<String>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if let Some(nickname) = nickname {
        writer.write_line(&nickname).await?;
    }
    while let Some(line) = input.recv().await {
        writer.write_line(&line).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

async fn forward_output<R, O>(mut reader: LineReader<R>, mut output: LineWriter<O>) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    while let Some(line) = reader.read_line().await? {
        output.write_line(&line).await?;
    }
    Ok(())
}
