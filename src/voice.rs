//! UDP relay for the voice chat channel.
//!
//! Every client address gets its own backend-facing socket, so the backend
//! sees one peer per player and replies can be routed back without parsing
//! the voice protocol.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Largest datagram we relay
const MAX_DATAGRAM: usize = 65_535;

/// Counters for one relay
#[derive(Debug, Default)]
pub struct RelayStats {
    sessions_created: AtomicU64,
    sessions_expired: AtomicU64,
    datagrams_forwarded: AtomicU64,
    datagrams_returned: AtomicU64,
}

impl RelayStats {
    pub fn sessions_created(&self) -> u64 {
        self.sessions_created.load(Ordering::Relaxed)
    }

    pub fn sessions_expired(&self) -> u64 {
        self.sessions_expired.load(Ordering::Relaxed)
    }

    pub fn datagrams_forwarded(&self) -> u64 {
        self.datagrams_forwarded.load(Ordering::Relaxed)
    }

    pub fn datagrams_returned(&self) -> u64 {
        self.datagrams_returned.load(Ordering::Relaxed)
    }
}

/// One client's path to the backend
pub struct VoiceSession {
    client: SocketAddr,
    socket: UdpSocket,
    last_seen: Mutex<Instant>,
    return_task: Mutex<Option<JoinHandle<()>>>,
}

impl VoiceSession {
    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

pub struct VoiceRelay {
    server: String,
    socket: UdpSocket,
    backend: SocketAddr,
    idle_timeout: Duration,
    sessions: Mutex<HashMap<String, Arc<VoiceSession>>>,
    stats: RelayStats,
}

impl VoiceRelay {
    /// Bind the public voice port. The backend address is resolved once
    /// here so new sessions never wait on a lookup.
    pub async fn bind(
        server: &str,
        bind_addr: &str,
        port: u16,
        backend: String,
        idle_timeout: Duration,
    ) -> std::io::Result<Arc<Self>> {
        let backend = tokio::net::lookup_host(backend.as_str())
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address found for {}", backend),
                )
            })?;
        let socket = UdpSocket::bind((bind_addr, port)).await?;
        info!(server, port, backend = %backend, "Voice relay listening");
        Ok(Arc::new(Self {
            server: server.to_string(),
            socket,
            backend,
            idle_timeout,
            sessions: Mutex::new(HashMap::new()),
            stats: RelayStats::default(),
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Wait for the next datagram on the public port
    pub async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    /// Forward one client datagram to the backend, creating the client's
    /// session on first contact.
    pub async fn handle_datagram(
        self: &Arc<Self>,
        payload: &[u8],
        from: SocketAddr,
    ) -> std::io::Result<()> {
        let session = self.session_for(from).await?;
        session.touch();
        session.socket.send(payload).await?;
        self.stats.datagrams_forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn session_for(self: &Arc<Self>, from: SocketAddr) -> std::io::Result<Arc<VoiceSession>> {
        let key = from.to_string();
        let existing = self.sessions.lock().get(&key).cloned();
        if let Some(existing) = existing {
            return Ok(existing);
        }

        // Socket setup happens outside the lock; the insert below decides
        // which session wins if two were built concurrently.
        let unspecified = if self.backend.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(unspecified).await?;
        socket.connect(self.backend).await?;
        let candidate = Arc::new(VoiceSession {
            client: from,
            socket,
            last_seen: Mutex::new(Instant::now()),
            return_task: Mutex::new(None),
        });

        let (session, created) = self.insert_or_adopt(key, candidate);

        if created {
            self.stats.sessions_created.fetch_add(1, Ordering::Relaxed);
            debug!(server = %self.server, client = %from, "Voice session created");
            let relay = Arc::clone(self);
            let returning = Arc::clone(&session);
            let task = tokio::spawn(async move { relay.return_loop(returning).await });
            *session.return_task.lock() = Some(task);
        }

        Ok(session)
    }

    /// Register `candidate` unless another session for `key` won the race
    fn insert_or_adopt(&self, key: String, candidate: Arc<VoiceSession>) -> (Arc<VoiceSession>, bool) {
        let mut sessions = self.sessions.lock();
        match sessions.get(&key) {
            Some(existing) => (Arc::clone(existing), false),
            None => {
                sessions.insert(key, Arc::clone(&candidate));
                (candidate, true)
            }
        }
    }

    /// Copy backend replies to the client until the session idles out or
    /// the backend socket fails
    async fn return_loop(self: Arc<Self>, session: Arc<VoiceSession>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match tokio::time::timeout(self.idle_timeout, session.socket.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    session.touch();
                    if let Err(e) = self.socket.send_to(&buf[..n], session.client).await {
                        debug!(server = %self.server, client = %session.client, error = %e, "Voice reply failed");
                        break;
                    }
                    self.stats.datagrams_returned.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    debug!(server = %self.server, client = %session.client, error = %e, "Voice backend socket failed");
                    break;
                }
                Err(_) => {
                    if session.idle_for() >= self.idle_timeout {
                        debug!(server = %self.server, client = %session.client, "Voice session idle");
                        break;
                    }
                }
            }
        }
        self.evict(&session);
    }

    /// Drop `session` from the table if it is still the registered one
    fn evict(&self, session: &Arc<VoiceSession>) {
        let key = session.client.to_string();
        let mut sessions = self.sessions.lock();
        if sessions.get(&key).is_some_and(|current| Arc::ptr_eq(current, session)) {
            sessions.remove(&key);
            self.stats.sessions_expired.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Stop all return loops and forget every session
    pub fn shutdown(&self) {
        let sessions: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            if let Some(task) = session.return_task.lock().take() {
                task.abort();
            }
        }
        debug!(server = %self.server, "Voice relay closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn echo_backend() -> (SocketAddr, Arc<AtomicU64>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let received = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&received);
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let (n, from) = socket.recv_from(&mut buf).await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                socket.send_to(&buf[..n], from).await.unwrap();
            }
        });
        (addr, received)
    }

    fn spawn_pump(relay: Arc<VoiceRelay>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            while let Ok((n, from)) = relay.recv_from(&mut buf).await {
                let _ = relay.handle_datagram(&buf[..n], from).await;
            }
        });
    }

    #[tokio::test]
    async fn test_one_session_per_client() {
        let (backend, received) = echo_backend().await;
        let relay = VoiceRelay::bind("Lobby", "127.0.0.1", 0, backend.to_string(), Duration::from_secs(30))
            .await
            .unwrap();
        let public = relay.local_addr().unwrap();
        spawn_pump(Arc::clone(&relay));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 64];
        for payload in [&b"first"[..], &b"second"[..]] {
            client.send_to(payload, public).await.unwrap();
            let (n, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..n], payload);
            assert_eq!(from, public);
        }

        assert_eq!(relay.stats().sessions_created(), 1);
        assert_eq!(relay.stats().datagrams_forwarded(), 2);
        assert_eq!(relay.stats().datagrams_returned(), 2);
        assert_eq!(received.load(Ordering::SeqCst), 2);
        assert_eq!(relay.session_count(), 1);
    }

    #[tokio::test]
    async fn test_clients_get_separate_sessions() {
        let (backend, _) = echo_backend().await;
        let relay = VoiceRelay::bind("Lobby", "127.0.0.1", 0, backend.to_string(), Duration::from_secs(30))
            .await
            .unwrap();

        let a: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:40002".parse().unwrap();
        relay.handle_datagram(b"x", a).await.unwrap();
        relay.handle_datagram(b"y", b).await.unwrap();
        relay.handle_datagram(b"z", a).await.unwrap();

        assert_eq!(relay.stats().sessions_created(), 2);
        assert_eq!(relay.session_count(), 2);
        relay.shutdown();
        assert_eq!(relay.session_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_packets_share_a_session() {
        let (backend, received) = echo_backend().await;
        let relay = VoiceRelay::bind("Lobby", "127.0.0.1", 0, backend.to_string(), Duration::from_secs(30))
            .await
            .unwrap();

        let client: SocketAddr = "127.0.0.1:40004".parse().unwrap();
        let (a, b) = tokio::join!(
            relay.handle_datagram(b"one", client),
            relay.handle_datagram(b"two", client)
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(relay.stats().sessions_created(), 1);
        assert_eq!(relay.session_count(), 1);
        assert_eq!(relay.stats().datagrams_forwarded(), 2);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(received.load(Ordering::SeqCst), 2);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_losing_candidate_adopts_existing_session() {
        let (backend, _) = echo_backend().await;
        let relay = VoiceRelay::bind("Lobby", "127.0.0.1", 0, backend.to_string(), Duration::from_secs(30))
            .await
            .unwrap();
        let client: SocketAddr = "127.0.0.1:40005".parse().unwrap();

        let candidate = |socket: UdpSocket| {
            Arc::new(VoiceSession {
                client,
                socket,
                last_seen: Mutex::new(Instant::now()),
                return_task: Mutex::new(None),
            })
        };
        let first = candidate(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let second = candidate(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let (winner, created) = relay.insert_or_adopt(client.to_string(), Arc::clone(&first));
        assert!(created);
        assert!(Arc::ptr_eq(&winner, &first));

        let (winner, created) = relay.insert_or_adopt(client.to_string(), second);
        assert!(!created);
        assert!(Arc::ptr_eq(&winner, &first));
        assert_eq!(relay.session_count(), 1);
    }

    #[tokio::test]
    async fn test_unresolvable_backend_fails_bind() {
        let result = VoiceRelay::bind(
            "Lobby",
            "127.0.0.1",
            0,
            "not-an-address".to_string(),
            Duration::from_secs(30),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_idle_session_expires() {
        let (backend, _) = echo_backend().await;
        let relay = VoiceRelay::bind(
            "Lobby",
            "127.0.0.1",
            0,
            backend.to_string(),
            Duration::from_millis(200),
        )
        .await
        .unwrap();

        let client: SocketAddr = "127.0.0.1:40003".parse().unwrap();
        relay.handle_datagram(b"hello", client).await.unwrap();
        assert_eq!(relay.session_count(), 1);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(relay.session_count(), 0);
        assert_eq!(relay.stats().sessions_expired(), 1);

        // The next datagram opens a fresh session
        relay.handle_datagram(b"again", client).await.unwrap();
        assert_eq!(relay.stats().sessions_created(), 2);
    }
}
