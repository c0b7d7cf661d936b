//! Shared nickname → connection map.
//!
//! The map itself never leaves this module: callers go through
//! [`ClientRegistry`] operations, each of which holds the lock only long
//! enough to mutate or copy out of the map. Socket I/O never happens under
//! the lock; broadcast hands lines to each connection's outbound queue after
//! the lock is released.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::nickname::Nickname;

pub type ConnectionId = u64;

/// What the registry keeps for each registered connection.
///
/// The connection's handler owns the transport; the registry only holds the
/// sending side of its outbound queue and the token that cancels it.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: ConnectionId,
    outbox: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl PeerHandle {
    pub fn new(id: ConnectionId, outbox: mpsc::Sender<String>, cancel: CancellationToken) -> Self {
        Self { id, outbox, cancel }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("nickname '{0}' is already in use")]
    Conflict(Nickname),
}

/// Outcome of a single [`ClientRegistry::broadcast`] call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: Vec<Nickname>,
}

#[derive(Clone)]
pub struct ClientRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    peers: Mutex<HashMap<Nickname, PeerHandle>>,
    next_id: AtomicU64,
    send_timeout: Duration,
}

impl ClientRegistry {
    /// `send_timeout` bounds how long a broadcast waits on one peer's full queue.
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                peers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                send_timeout,
            }),
        }
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts `nickname` unless another connection already holds it.
    ///
    /// Check and insert happen under one lock acquisition, so concurrent
    /// attempts for the same nickname see exactly one `Ok`.
    pub async fn try_register(
        &self,
        nickname: Nickname,
        peer: PeerHandle,
    ) -> Result<(), RegisterError> {
        let mut peers = self.inner.peers.lock().await;
        if peers.contains_key(&nickname) {
            return Err(RegisterError::Conflict(nickname));
        }
        peers.insert(nickname, peer);
        Ok(())
    }

    /// Removes `nickname` if present. Absent nicknames are a no-op.
    pub async fn deregister(&self, nickname: &str) -> bool {
        let mut peers = self.inner.peers.lock().await;
        peers.remove(nickname).is_some()
    }

    /// Removes `nickname` only while it still belongs to connection `id`.
    pub async fn deregister_connection(&self, nickname: &Nickname, id: ConnectionId) -> bool {
        let mut peers = self.inner.peers.lock().await;
        match peers.get(nickname) {
            Some(peer) if peer.id == id => {
                peers.remove(nickname);
                true
            }
            _ => false,
        }
    }

    /// Queues `line` for every registered connection except `exclude`.
    ///
    /// Recipients whose queue stays full for longer than the send timeout, or
    /// whose connection has already gone away, are deregistered and
    /// cancelled. Their failure is reported, never returned as an error.
    pub async fn broadcast(&self, line: &str, exclude: &Nickname) -> BroadcastReport {
        let recipients: Vec<(Nickname, PeerHandle)> = {
            let peers = self.inner.peers.lock().await;
            peers
                .iter()
                .filter(|(nickname, _)| *nickname != exclude)
                .map(|(nickname, peer)| (nickname.clone(), peer.clone()))
                .collect()
        };

        let send_timeout = self.inner.send_timeout;
        let deliveries = recipients.into_iter().map(|(nickname, peer)| async move {
            let outcome = peer
                .outbox
                .send_timeout(line.to_owned(), send_timeout)
                .await;
            (nickname, peer, outcome)
        });

        let mut report = BroadcastReport::default();
        for (nickname, peer, outcome) in join_all(deliveries).await {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    warn!(%nickname, "peer is not keeping up; disconnecting");
                    self.evict(&nickname, &peer).await;
                    report.evicted.push(nickname);
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    debug!(%nickname, "peer outbox already closed");
                    self.evict(&nickname, &peer).await;
                    report.evicted.push(nickname);
                }
            }
        }

        report
    }

    async fn evict(&self, nickname: &Nickname, peer: &PeerHandle) {
        self.deregister_connection(nickname, peer.id).await;
        peer.close();
    }

    /// Point-in-time listing of registered nicknames.
    pub async fn snapshot(&self) -> BTreeSet<Nickname> {
        let peers = self.inner.peers.lock().await;
        peers.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.peers.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nick(raw: &str) -> Nickname {
        Nickname::try_from(raw).expect("valid nickname")
    }

    fn peer(
        registry: &ClientRegistry,
        capacity: usize,
    ) -> (PeerHandle, mpsc::Receiver<String>, CancellationToken) {
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let handle = PeerHandle::new(registry.next_connection_id(), tx, cancel.clone());
        (handle, rx, cancel)
    }

    #[tokio::test]
    async fn rejects_duplicate_nicknames() {
        let registry = ClientRegistry::new(Duration::from_millis(100));
        let (first, _rx_a, _) = peer(&registry, 4);
        let (second, _rx_b, _) = peer(&registry, 4);

        registry
            .try_register(nick("alice"), first.clone())
            .await
            .expect("first registration should pass");
        let result = registry.try_register(nick("alice"), second).await;
        assert_eq!(result, Err(RegisterError::Conflict(nick("alice"))));

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains("alice"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registration_admits_exactly_one() {
        let registry = ClientRegistry::new(Duration::from_millis(100));
        let mut attempts = Vec::new();
        let mut receivers = Vec::new();

        for _ in 0..32 {
            let (handle, rx, _) = peer(&registry, 1);
            receivers.push(rx);
            let registry = registry.clone();
            attempts.push(tokio::spawn(async move {
                registry.try_register(nick("alice"), handle).await
            }));
        }

        let mut ok = 0;
        let mut conflicts = 0;
        for attempt in attempts {
            match attempt.await.expect("task panicked") {
                Ok(()) => ok += 1,
                Err(RegisterError::Conflict(_)) => conflicts += 1,
            }
        }

        assert_eq!(ok, 1);
        assert_eq!(conflicts, 31);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn deregister_is_idempotent() {
        let registry = ClientRegistry::new(Duration::from_millis(100));
        let (handle, _rx, _) = peer(&registry, 4);
        registry.try_register(nick("alice"), handle).await.unwrap();

        assert!(registry.deregister("alice").await);
        assert!(!registry.deregister("alice").await);
        assert!(!registry.deregister("nobody").await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn deregister_connection_ignores_newer_holder() {
        let registry = ClientRegistry::new(Duration::from_millis(100));
        let (old, _rx_old, _) = peer(&registry, 4);
        let (new, _rx_new, _) = peer(&registry, 4);
        let old_id = old.id();

        registry.try_register(nick("alice"), old).await.unwrap();
        registry.deregister("alice").await;
        registry.try_register(nick("alice"), new).await.unwrap();

        assert!(!registry.deregister_connection(&nick("alice"), old_id).await);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn broadcast_skips_sender() {
        let registry = ClientRegistry::new(Duration::from_millis(100));
        let (alice, mut rx_alice, _) = peer(&registry, 4);
        let (bob, mut rx_bob, _) = peer(&registry, 4);
        registry.try_register(nick("alice"), alice).await.unwrap();
        registry.try_register(nick("bob"), bob).await.unwrap();

        let report = registry.broadcast("hello", &nick("alice")).await;

        assert_eq!(report.delivered, 1);
        assert!(report.evicted.is_empty());
        assert_eq!(rx_bob.recv().await.as_deref(), Some("hello"));
        assert!(rx_alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_preserves_sender_order() {
        let registry = ClientRegistry::new(Duration::from_millis(100));
        let (alice, _rx_alice, _) = peer(&registry, 8);
        let (bob, mut rx_bob, _) = peer(&registry, 8);
        registry.try_register(nick("alice"), alice).await.unwrap();
        registry.try_register(nick("bob"), bob).await.unwrap();

        for line in ["one", "two", "three"] {
            registry.broadcast(line, &nick("alice")).await;
        }

        for expected in ["one", "two", "three"] {
            assert_eq!(rx_bob.recv().await.as_deref(), Some(expected));
        }
    }

    #[tokio::test]
    async fn stalled_peer_is_evicted_without_blocking_others() {
        let registry = ClientRegistry::new(Duration::from_millis(50));
        let (alice, _rx_alice, _) = peer(&registry, 4);
        let (bob, mut rx_bob, _) = peer(&registry, 4);
        let (carol, _rx_carol, carol_cancel) = peer(&registry, 1);
        registry.try_register(nick("alice"), alice).await.unwrap();
        registry.try_register(nick("bob"), bob).await.unwrap();
        registry.try_register(nick("carol"), carol).await.unwrap();

        // Carol never drains her queue, so the second line cannot be queued.
        registry.broadcast("first", &nick("alice")).await;
        let report = tokio::time::timeout(
            Duration::from_secs(1),
            registry.broadcast("second", &nick("alice")),
        )
        .await
        .expect("broadcast should finish within the send timeout");

        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, vec![nick("carol")]);
        assert!(carol_cancel.is_cancelled());
        assert_eq!(rx_bob.recv().await.as_deref(), Some("first"));
        assert_eq!(rx_bob.recv().await.as_deref(), Some("second"));
        assert!(!registry.snapshot().await.contains("carol"));
    }

    #[tokio::test]
    async fn closed_peer_is_evicted() {
        let registry = ClientRegistry::new(Duration::from_millis(50));
        let (alice, _rx_alice, _) = peer(&registry, 4);
        let (bob, rx_bob, _) = peer(&registry, 4);
        registry.try_register(nick("alice"), alice).await.unwrap();
        registry.try_register(nick("bob"), bob).await.unwrap();
        drop(rx_bob);

        let report = registry.broadcast("hello", &nick("alice")).await;

        assert_eq!(report.evicted, vec![nick("bob")]);
        assert_eq!(registry.len().await, 1);
    }
}
