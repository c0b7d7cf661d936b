use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    select,
    sync::Semaphore,
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    connection::{ConnectionContext, handle_connection},
    registry::ClientRegistry,
};

const SERVER_FULL: &[u8] = b"server is full\n";

pub struct ChatServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

/// Shared by the accept loop and every connection task.
struct ServerState {
    registry: ClientRegistry,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
    slots: Arc<Semaphore>,
}

impl ChatServer {
    /// Binds the listening socket described by `config`.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        let registry = ClientRegistry::new(config.write_timeout);
        let slots = Arc::new(Semaphore::new(
            config.max_connections.min(Semaphore::MAX_PERMITS),
        ));
        Self {
            listener,
            state: Arc::new(ServerState {
                registry,
                config: Arc::new(config),
                shutdown: CancellationToken::new(),
                slots,
            }),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle to the live registry, for diagnostics.
    pub fn registry(&self) -> ClientRegistry {
        self.state.registry.clone()
    }

    /// Cancelling this token has the same effect as the shutdown future
    /// passed to [`ChatServer::run_until`] resolving.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Accepts connections until `shutdown` resolves, then closes every
    /// connection and waits (up to the drain timeout) for them to finish.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let ChatServer { listener, state } = self;
        let tracker = TaskTracker::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                _ = state.shutdown.cancelled() => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &tracker);
                }
            }
        }

        drop(listener);
        handle_shutdown(&state, &tracker).await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(state: &ServerState, tracker: &TaskTracker) {
    info!(connections = tracker.len(), "server shutting down");
    state.shutdown.cancel();
    tracker.close();

    if timeout(state.config.drain_timeout, tracker.wait())
        .await
        .is_err()
    {
        warn!(
            remaining = tracker.len(),
            "connections still open after drain timeout"
        );
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
    tracker: &TaskTracker,
) {
    match result {
        Ok((stream, peer)) => spawn_connection(stream, peer, state, tracker),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<ServerState>,
    tracker: &TaskTracker,
) {
    let Ok(permit) = Arc::clone(&state.slots).try_acquire_owned() else {
        warn!(%peer, limit = state.config.max_connections, "rejecting connection, server is full");
        tracker.spawn(reject_connection(stream, state.config.write_timeout));
        return;
    };

    let state = Arc::clone(state);
    tracker.spawn(async move {
        let _permit = permit;
        let ctx = ConnectionContext {
            id: state.registry.next_connection_id(),
            peer: Some(peer),
            registry: state.registry.clone(),
            config: Arc::clone(&state.config),
            cancel: state.shutdown.child_token(),
        };

        debug!(%peer, id = ctx.id, "accepted connection");
        let (reader, writer) = stream.into_split();
        let disconnect = handle_connection(reader, writer, ctx).await;
        debug!(%peer, ?disconnect, "connection finished");
    });
}

async fn reject_connection(mut stream: TcpStream, write_timeout: Duration) {
    let result = timeout(write_timeout, async {
        stream.write_all(SERVER_FULL).await?;
        stream.shutdown().await
    })
    .await;

    if let Ok(Err(error)) = result {
        debug!(?error, "failed to notify rejected client");
    }
}
