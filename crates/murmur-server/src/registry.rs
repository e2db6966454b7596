use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use murmur_core::{ConnectionId, UserId};

pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

const CONNECTING: u8 = 0;
const OPEN: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// One live socket with a verified identity.
///
/// Outbound frames go through a bounded queue drained by the socket's writer
/// task, so per-connection delivery order is the order of `send` and
/// `respond` calls.
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: UserId,
    tx: mpsc::Sender<String>,
    state: AtomicU8,
    last_pong: AtomicU64,
    dropped: AtomicU64,
    closed: CancellationToken,
}

impl Connection {
    /// A new connection in the `Connecting` state and the receiving half of
    /// its outbound queue.
    pub fn new(user_id: UserId, max_send_queue: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(max_send_queue.max(1));
        let conn = Self {
            id: ConnectionId::new(),
            user_id,
            tx,
            state: AtomicU8::new(CONNECTING),
            last_pong: AtomicU64::new(now_secs()),
            dropped: AtomicU64::new(0),
            closed: CancellationToken::new(),
        };
        (conn, rx)
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            CONNECTING => ConnectionState::Connecting,
            OPEN => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// `Connecting → Open`. Returns `false` only if the connection is closed.
    fn mark_open(&self) -> bool {
        match self
            .state
            .compare_exchange(CONNECTING, OPEN, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == OPEN,
        }
    }

    fn mark_closed(&self) {
        self.state.store(CLOSED, Ordering::Release);
        self.closed.cancel();
    }

    /// Completes once the connection is closed, e.g. reaped by cleanup.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Queue a frame. Full or closed queues drop the frame; the caller never
    /// blocks on a slow peer.
    pub fn send(&self, text: String) -> bool {
        if self.state() == ConnectionState::Closed {
            return false;
        }
        match self.tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    conn_id = %self.id,
                    msg_len = msg.len(),
                    "Send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a reply to this connection's own request, waiting for room
    /// instead of dropping. Fails only once the connection is closed.
    pub async fn respond(&self, text: String) -> bool {
        if self.state() == ConnectionState::Closed {
            return false;
        }
        tokio::select! {
            sent = self.tx.send(text) => sent.is_ok(),
            _ = self.closed.cancelled() => false,
        }
    }

    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The set of open connections. Injected into the hub and the socket loop;
/// no process-wide instance exists.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    max_send_queue: usize,
    client_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self::with_timeout(max_send_queue, CLIENT_TIMEOUT)
    }

    pub fn with_timeout(max_send_queue: usize, client_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
            client_timeout,
        }
    }

    /// Create a connection for a verified user and register it.
    pub fn open(&self, user_id: UserId) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let (conn, rx) = Connection::new(user_id, self.max_send_queue);
        let conn = Arc::new(conn);
        self.register(Arc::clone(&conn));
        (conn, rx)
    }

    /// Insert and mark open. Registering the same connection twice is a
    /// no-op; a closed connection is refused.
    pub fn register(&self, conn: Arc<Connection>) -> bool {
        if !conn.mark_open() {
            return false;
        }
        let id = conn.id.clone();
        self.connections.entry(id.clone()).or_insert(conn);
        tracing::debug!(conn_id = %id, count = self.connections.len(), "connection registered");
        true
    }

    /// Remove and mark closed. Safe to call more than once.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let (_, conn) = self.connections.remove(id)?;
        conn.mark_closed();
        tracing::debug!(conn_id = %id, count = self.connections.len(), "connection unregistered");
        Some(conn)
    }

    /// Snapshot of every open connection except `id`, taken now.
    pub fn all_except(&self, id: &ConnectionId) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|entry| entry.key() != id && entry.value().is_open())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Best-effort fan-out to everyone but `sender`. Returns how many peers
    /// accepted the frame.
    pub fn broadcast_except(&self, sender: &ConnectionId, text: &str) -> usize {
        let peers = self.all_except(sender);
        let total = peers.len();
        let delivered = peers
            .into_iter()
            .filter(|peer| peer.send(text.to_string()))
            .count();
        if delivered < total {
            tracing::debug!(total, delivered, "broadcast partially delivered");
        }
        delivered
    }

    /// Fan-out to every open connection (used for writes that arrive over REST).
    pub fn broadcast_all(&self, text: &str) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().is_open())
            .map(|entry| Arc::clone(entry.value()))
            .collect::<Vec<_>>()
            .into_iter()
            .filter(|conn| conn.send(text.to_string()))
            .count()
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Unregister connections that haven't answered a ping within the timeout.
    pub fn cleanup_dead_clients(&self) -> usize {
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| !entry.value().is_alive(self.client_timeout))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for id in dead {
            if self.unregister(&id).is_some() {
                removed += 1;
                tracing::info!(conn_id = %id, "Cleaned up dead connection");
            }
        }
        removed
    }
}

/// Periodically reap dead connections until `cancel` fires.
pub fn start_cleanup_task(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = registry.cleanup_dead_clients();
                    if removed > 0 {
                        tracing::info!(removed, "Dead connection cleanup");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_registers_and_unregister_closes() {
        let registry = ConnectionRegistry::new(32);
        let (a, _rx_a) = registry.open(UserId(1));
        let (b, _rx_b) = registry.open(UserId(2));
        assert_eq!(registry.count(), 2);
        assert!(a.is_open());

        registry.unregister(&a.id);
        assert_eq!(registry.count(), 1);
        assert_eq!(a.state(), ConnectionState::Closed);

        registry.unregister(&b.id);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn register_is_idempotent() {
        let registry = ConnectionRegistry::new(32);
        let (conn, _rx) = Connection::new(UserId(1), 32);
        let conn = Arc::new(conn);
        assert_eq!(conn.state(), ConnectionState::Connecting);

        assert!(registry.register(Arc::clone(&conn)));
        assert!(registry.register(Arc::clone(&conn)));
        assert_eq!(registry.count(), 1);
        assert!(conn.is_open());
    }

    #[test]
    fn unregister_twice_is_safe() {
        let registry = ConnectionRegistry::new(32);
        let (conn, _rx) = registry.open(UserId(1));
        assert!(registry.unregister(&conn.id).is_some());
        assert!(registry.unregister(&conn.id).is_none());
    }

    #[test]
    fn closed_connection_cannot_reopen() {
        let registry = ConnectionRegistry::new(32);
        let (conn, _rx) = registry.open(UserId(1));
        registry.unregister(&conn.id);
        assert!(!registry.register(Arc::clone(&conn)));
        assert_eq!(registry.count(), 0);
        assert!(!conn.send("late".into()));
    }

    #[test]
    fn broadcast_skips_sender() {
        let registry = ConnectionRegistry::new(32);
        let (sender, mut rx_sender) = registry.open(UserId(1));
        let (_b, mut rx_b) = registry.open(UserId(2));
        let (_c, mut rx_c) = registry.open(UserId(3));

        let delivered = registry.broadcast_except(&sender.id, "event");
        assert_eq!(delivered, 2);
        assert!(rx_sender.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), "event");
        assert_eq!(rx_c.try_recv().unwrap(), "event");
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn broadcast_survives_dead_peer() {
        let registry = ConnectionRegistry::new(32);
        let (sender, _rx_sender) = registry.open(UserId(1));
        let (_gone, rx_gone) = registry.open(UserId(2));
        let (_alive, mut rx_alive) = registry.open(UserId(3));
        drop(rx_gone);

        let delivered = registry.broadcast_except(&sender.id, "event");
        assert_eq!(delivered, 1);
        assert_eq!(rx_alive.try_recv().unwrap(), "event");
    }

    #[test]
    fn broadcast_all_reaches_everyone() {
        let registry = ConnectionRegistry::new(32);
        let (_a, mut rx_a) = registry.open(UserId(1));
        let (_b, mut rx_b) = registry.open(UserId(2));
        assert_eq!(registry.broadcast_all("x"), 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn all_except_is_a_snapshot() {
        let registry = ConnectionRegistry::new(32);
        let (a, _rx_a) = registry.open(UserId(1));
        let (_b, _rx_b) = registry.open(UserId(2));
        let snapshot = registry.all_except(&a.id);
        let (_late, _rx_late) = registry.open(UserId(3));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.all_except(&a.id).len(), 2);
    }

    #[tokio::test]
    async fn respond_waits_for_room() {
        let registry = ConnectionRegistry::new(1);
        let (conn, mut rx) = registry.open(UserId(1));
        assert!(conn.send("event".into()));
        assert!(!conn.send("overflow".into()));

        let (sent, drained) = tokio::join!(conn.respond("reply".into()), async {
            (rx.recv().await, rx.recv().await)
        });
        assert!(sent);
        assert_eq!(drained, (Some("event".into()), Some("reply".into())));
    }

    #[tokio::test]
    async fn respond_gives_up_when_closed() {
        let registry = Arc::new(ConnectionRegistry::new(1));
        let (conn, _rx) = registry.open(UserId(1));
        assert!(conn.send("fills the queue".into()));

        let pending = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.respond("reply".into()).await }
        });
        tokio::task::yield_now().await;
        registry.unregister(&conn.id);

        let sent = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(!sent);
        assert!(!conn.respond("late".into()).await);
    }

    #[tokio::test]
    async fn reaping_signals_closed() {
        let registry = ConnectionRegistry::new(8);
        let (conn, _rx) = registry.open(UserId(1));
        conn.last_pong.store(0, Ordering::Relaxed);

        let waiter = conn.closed();
        assert_eq!(registry.cleanup_dead_clients(), 1);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap();
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let registry = ConnectionRegistry::new(2);
        let (conn, _rx) = registry.open(UserId(1));
        assert!(conn.send("msg1".into()));
        assert!(conn.send("msg2".into()));
        assert!(!conn.send("msg3".into()));
        assert_eq!(conn.dropped_messages(), 1);
    }

    #[test]
    fn cleanup_dead_clients_removes_expired() {
        let registry = ConnectionRegistry::new(32);
        let (stale, _rx1) = registry.open(UserId(1));
        let (_fresh, _rx2) = registry.open(UserId(2));
        stale.last_pong.store(0, Ordering::Relaxed);

        assert_eq!(registry.cleanup_dead_clients(), 1);
        assert_eq!(registry.count(), 1);
        assert_eq!(stale.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn cleanup_task_stops_on_cancel() {
        let registry = Arc::new(ConnectionRegistry::new(8));
        let cancel = CancellationToken::new();
        let handle = start_cleanup_task(registry, Duration::from_millis(10), cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
