//! Per-connection lifecycle: nickname registration, relay, teardown.
//!
//! A connection moves through registering → active → closing. While
//! registering, the handler writes to the socket directly. Once registered it
//! hands the write half to a writer task fed by a bounded queue, so broadcasts
//! from other connections never touch this socket themselves.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite, BufReader},
    select,
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, sleep_until, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    nickname::Nickname,
    registry::{ClientRegistry, ConnectionId, PeerHandle, RegisterError},
    transport::{LineReader, LineWriter, TransportError},
};

/// Everything a handler needs besides the socket itself.
#[derive(Clone)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub peer: Option<SocketAddr>,
    pub registry: ClientRegistry,
    pub config: Arc<ServerConfig>,
    /// Cancelled on eviction, writer failure, or server shutdown.
    pub cancel: CancellationToken,
}

/// Why a connection ended.
#[derive(Debug)]
pub enum Disconnect {
    PeerClosed,
    Conflict(Nickname),
    InvalidNickname,
    /// No acceptable nickname arrived within the registration timeout.
    RegistrationTimedOut,
    Cancelled,
    Transport(TransportError),
}

impl Disconnect {
    fn reason_line(&self) -> Option<String> {
        match self {
            Disconnect::Transport(err) if err.is_malformed() => {
                Some(format!("closing connection: {err}"))
            }
            Disconnect::RegistrationTimedOut => {
                Some("closing connection: timed out waiting for nickname".to_string())
            }
            _ => None,
        }
    }
}

impl From<TransportError> for Disconnect {
    fn from(err: TransportError) -> Self {
        Disconnect::Transport(err)
    }
}

struct Registration {
    nickname: Nickname,
    outbox: mpsc::Sender<String>,
    inbox: mpsc::Receiver<String>,
}

/// Drives one connection from its first byte to teardown.
///
/// Never returns an error: every failure is confined to this connection and
/// reported as a [`Disconnect`].
pub async fn handle_connection<R, W>(reader: R, writer: W, ctx: ConnectionContext) -> Disconnect
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader =
        LineReader::with_max_line_bytes(BufReader::new(reader), ctx.config.max_line_bytes);
    let mut writer = LineWriter::new(writer);

    let registration = match register(&mut reader, &mut writer, &ctx).await {
        Ok(registration) => registration,
        Err(disconnect) => {
            debug!(peer = ?ctx.peer, ?disconnect, "registration failed");
            if let Some(reason) = disconnect.reason_line() {
                if let Err(error) = write_direct(&mut writer, &reason, &ctx).await {
                    debug!(?error, "failed to send closing reason");
                }
            }
            shutdown_writer(&mut writer).await;
            ctx.cancel.cancel();
            return disconnect;
        }
    };

    let Registration {
        nickname,
        outbox,
        inbox,
    } = registration;

    if let Err(err) = write_direct(&mut writer, &format!("welcome, {nickname}"), &ctx).await {
        ctx.registry.deregister_connection(&nickname, ctx.id).await;
        ctx.cancel.cancel();
        return Disconnect::Transport(err);
    }
    info!(peer = ?ctx.peer, %nickname, "client joined");

    let writer_task = tokio::spawn(run_writer(
        writer,
        inbox,
        ctx.cancel.clone(),
        ctx.config.write_timeout,
    ));

    let disconnect = relay(&mut reader, &nickname, &ctx).await;
    close(&ctx, &nickname, outbox, writer_task, disconnect.reason_line()).await;

    info!(peer = ?ctx.peer, %nickname, ?disconnect, "client disconnected");
    disconnect
}

async fn register<R, W>(
    reader: &mut LineReader<R>,
    writer: &mut LineWriter<W>,
    ctx: &ConnectionContext,
) -> Result<Registration, Disconnect>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let attempts = ctx.config.nickname_attempts.max(1);
    // One deadline covers every attempt, so retries cannot extend it.
    let deadline = Instant::now() + ctx.config.registration_timeout;

    for attempt in 1..=attempts {
        let line = select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(Disconnect::Cancelled),
            _ = sleep_until(deadline) => return Err(Disconnect::RegistrationTimedOut),
            line = reader.read_line() => line,
        };
        let raw = match line? {
            Some(raw) => raw,
            None => return Err(Disconnect::PeerClosed),
        };

        let nickname = match Nickname::parse(&raw, ctx.config.max_nickname_bytes) {
            Ok(nickname) => nickname,
            Err(err) => {
                debug!(peer = ?ctx.peer, attempt, error = %err, "invalid nickname");
                if attempt < attempts {
                    write_direct(writer, &format!("{err}, try again"), ctx).await?;
                }
                continue;
            }
        };

        let (outbox, inbox) = mpsc::channel(ctx.config.outbox_capacity.max(1));
        let handle = PeerHandle::new(ctx.id, outbox.clone(), ctx.cancel.clone());

        match ctx.registry.try_register(nickname.clone(), handle).await {
            Ok(()) => {
                return Ok(Registration {
                    nickname,
                    outbox,
                    inbox,
                });
            }
            Err(err @ RegisterError::Conflict(_)) => {
                info!(peer = ?ctx.peer, %nickname, "nickname already in use");
                write_direct(writer, &err.to_string(), ctx).await?;
                return Err(Disconnect::Conflict(nickname));
            }
        }
    }

    write_direct(writer, "too many invalid nicknames, closing connection", ctx).await?;
    Err(Disconnect::InvalidNickname)
}

async fn relay<R>(
    reader: &mut LineReader<R>,
    nickname: &Nickname,
    ctx: &ConnectionContext,
) -> Disconnect
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        let line = select! {
            biased;
            _ = ctx.cancel.cancelled() => return Disconnect::Cancelled,
            line = reader.read_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                let report = ctx.registry.broadcast(&line, nickname).await;
                debug!(
                    %nickname,
                    delivered = report.delivered,
                    evicted = report.evicted.len(),
                    "relayed line"
                );
            }
            Ok(None) => return Disconnect::PeerClosed,
            Err(err) => return Disconnect::Transport(err),
        }
    }
}

/// Drains this connection's queue to its socket until the queue closes or
/// the connection is cancelled. A failed or slow write cancels the connection.
async fn run_writer<W>(
    mut writer: LineWriter<W>,
    mut inbox: mpsc::Receiver<String>,
    cancel: CancellationToken,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let line = select! {
            biased;
            _ = cancel.cancelled() => break,
            line = inbox.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        match timeout(write_timeout, writer.write_line(&line)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(error = ?err, "failed to deliver line to client");
                cancel.cancel();
                break;
            }
            Err(_) => {
                warn!(?write_timeout, "write to client timed out");
                cancel.cancel();
                break;
            }
        }
    }

    shutdown_writer(&mut writer).await;
}

async fn close(
    ctx: &ConnectionContext,
    nickname: &Nickname,
    outbox: mpsc::Sender<String>,
    mut writer_task: JoinHandle<()>,
    reason: Option<String>,
) {
    ctx.registry.deregister_connection(nickname, ctx.id).await;

    if let Some(reason) = reason {
        let _ = outbox.try_send(reason);
    }
    // The writer exits once every sender is gone; broadcasts still holding a
    // clone let go within the write timeout.
    drop(outbox);

    if timeout(ctx.config.write_timeout, &mut writer_task)
        .await
        .is_err()
    {
        ctx.cancel.cancel();
        let _ = writer_task.await;
    }
    ctx.cancel.cancel();
}

/// Writes one line straight to the socket, before the writer task owns it.
async fn write_direct<W>(
    writer: &mut LineWriter<W>,
    line: &str,
    ctx: &ConnectionContext,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    timeout(ctx.config.write_timeout, writer.write_line(line))
        .await
        .map_err(|_| TransportError::TimedOut)?
}

async fn shutdown_writer<W>(writer: &mut LineWriter<W>)
where
    W: AsyncWrite + Unpin,
{
    if let Err(error) = writer.shutdown().await {
        debug!(?error, "failed to shut down client writer cleanly");
    }
}
