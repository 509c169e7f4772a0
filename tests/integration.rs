//! Integration tests for Craftgate

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use craftgate::config::GatewayConfig;
use craftgate::discovery::{self, Discovery};
use craftgate::error::PanelError;
use craftgate::gateway::{self, GatewayContext};
use craftgate::handshake::{LOGIN_OFFLINE, LOGIN_STARTING};
use craftgate::lifecycle::ServerState;
use craftgate::panel::{Panel, PanelEvent, PanelServer, ServerStats};
use craftgate::protocol::{self, packet_id, Handshake, NextState, PlayerIdentity, Reader};
use craftgate::registry::ServerRegistry;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};

// ============================================================================
// Mock panel
// ============================================================================

struct MockPanel {
    servers: Mutex<Vec<PanelServer>>,
    files: Mutex<HashMap<String, String>>,
    running: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl MockPanel {
    fn new(servers: Vec<PanelServer>) -> Arc<Self> {
        Arc::new(Self {
            servers: Mutex::new(servers),
            files: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Panel for MockPanel {
    fn host(&self) -> &str {
        "127.0.0.1"
    }

    async fn list_servers(&self) -> Result<Vec<PanelServer>, PanelError> {
        Ok(self.servers.lock().clone())
    }

    async fn start_server(&self, _id: &str) -> Result<(), PanelError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_server(&self, _id: &str) -> Result<(), PanelError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn server_stats(&self, _id: &str) -> Result<ServerStats, PanelError> {
        Ok(ServerStats {
            running: self.running.load(Ordering::SeqCst),
        })
    }

    async fn read_file(&self, id: &str, path: &str, default: &str) -> Result<String, PanelError> {
        let key = format!("{}/{}", id, path);
        Ok(self
            .files
            .lock()
            .entry(key)
            .or_insert_with(|| default.to_string())
            .clone())
    }

    async fn write_file(&self, id: &str, path: &str, contents: &str) -> Result<(), PanelError> {
        self.files
            .lock()
            .insert(format!("{}/{}", id, path), contents.to_string());
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct Harness {
    panel: Arc<MockPanel>,
    registry: Arc<ServerRegistry>,
    discovery: Arc<Discovery>,
    ctx: GatewayContext,
    shutdown_tx: watch::Sender<bool>,
}

impl Harness {
    async fn start(servers: Vec<PanelServer>, port_offset: u16) -> Self {
        let panel = MockPanel::new(servers);
        let registry = ServerRegistry::new();
        let config = Arc::new(GatewayConfig {
            bind: "127.0.0.1".to_string(),
            port_offset,
            probe_timeout_secs: 1,
            connect_timeout_secs: 1,
            handshake_timeout_secs: 2,
            ..GatewayConfig::default()
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = GatewayContext {
            registry: Arc::clone(&registry),
            config: Arc::clone(&config),
            shutdown_rx,
        };
        let discovery = Discovery::new(panel.clone(), Arc::clone(&registry), config);

        discovery.discover().await.unwrap();
        gateway::spawn_pending(&ctx).await.unwrap();

        Self {
            panel,
            registry,
            discovery,
            ctx,
            shutdown_tx,
        }
    }
}

fn panel_server(id: &str, name: &str, port: u16) -> PanelServer {
    PanelServer {
        id: id.to_string(),
        name: name.to_string(),
        ip: "127.0.0.1".to_string(),
        port,
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Find an offset so that `internal + offset` is free for TCP and UDP
fn offset_for(internal: u16) -> (u16, u16) {
    for offset in (1000..=4000).step_by(100) {
        let Some(public) = internal.checked_add(offset) else {
            continue;
        };
        let tcp = std::net::TcpListener::bind(("127.0.0.1", public));
        let udp = std::net::UdpSocket::bind(("127.0.0.1", public));
        if tcp.is_ok() && udp.is_ok() {
            return (offset, public);
        }
    }
    panic!("no free public port for internal port {}", internal);
}

/// Wait until a condition holds
async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Wait for a port to become available (gateway listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn wait_for_port_closed(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn handshake(port: u16, next_state: NextState) -> Vec<u8> {
    Handshake {
        protocol_version: 767,
        server_address: "localhost".to_string(),
        server_port: port,
        next_state,
    }
    .encode()
}

async fn read_text_packet(stream: &mut TcpStream) -> (i32, String) {
    let packet = tokio::time::timeout(Duration::from_secs(5), protocol::read_packet(stream))
        .await
        .unwrap()
        .unwrap();
    let text = Reader::new(&packet.body).string(32767 * 3).unwrap();
    (packet.id, text)
}

/// Run a server-list ping through the gateway and return the status JSON
async fn query_status(port: u16) -> serde_json::Value {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(&handshake(port, NextState::Status)).await.unwrap();
    stream
        .write_all(&protocol::encode_packet(packet_id::STATUS_REQUEST, &[]))
        .await
        .unwrap();
    let (id, json) = read_text_packet(&mut stream).await;
    assert_eq!(id, packet_id::STATUS_RESPONSE);
    serde_json::from_str(&json).unwrap()
}

/// Try to log in through the gateway and return the disconnect reason
async fn attempt_login(port: u16, name: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(&handshake(port, NextState::Login)).await.unwrap();
    stream
        .write_all(
            &PlayerIdentity {
                name: name.to_string(),
                id: None,
            }
            .encode(),
        )
        .await
        .unwrap();
    let (id, reason) = read_text_packet(&mut stream).await;
    assert_eq!(id, packet_id::LOGIN_DISCONNECT);
    reason
}

/// A tiny game backend: answers status pings and greets logins by name
async fn spawn_game_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve_backend(socket));
        }
    });
    port
}

async fn serve_backend(mut socket: TcpStream) {
    let Ok(packet) = protocol::read_packet(&mut socket).await else {
        return;
    };
    let Ok(handshake) = Handshake::decode(&packet.body) else {
        return;
    };

    if handshake.next_state == NextState::Status {
        let _ = protocol::read_packet(&mut socket).await;
        let _ = socket
            .write_all(&protocol::status_response(767, "1.21.1", "live backend"))
            .await;
        return;
    }

    let Ok(login) = protocol::read_packet(&mut socket).await else {
        return;
    };
    let Ok(player) = PlayerIdentity::decode(&login.body) else {
        return;
    };
    let welcome = format!("Welcome {}", player.name);
    let _ = socket.write_all(&protocol::login_disconnect(&welcome)).await;
    let mut rest = Vec::new();
    let _ = socket.read_to_end(&mut rest).await;
}

// ============================================================================
// Offline handling
// ============================================================================

#[tokio::test]
async fn test_offline_status_is_answered_locally() {
    let port = free_port();
    let harness = Harness::start(
        vec![panel_server("lobby", "Lobby $ player-start&player-stop", port)],
        2000,
    )
    .await;
    assert!(wait_for_port(port, Duration::from_secs(5)).await);

    let status = query_status(port).await;
    assert_eq!(status["version"]["protocol"], 767);
    assert_eq!(
        status["description"]["text"],
        "Lobby is stopped, you can start it by joining"
    );
    assert_eq!(harness.panel.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_login_with_auto_start_starts_once() {
    let port = free_port();
    let harness = Harness::start(vec![panel_server("lobby", "Lobby $ player-start", port)], 2000).await;
    assert!(wait_for_port(port, Duration::from_secs(5)).await);

    let reason = attempt_login(port, "Steve").await;
    assert!(reason.contains(LOGIN_STARTING));
    assert_eq!(harness.panel.starts.load(Ordering::SeqCst), 1);

    let server = harness.registry.get("lobby").unwrap();
    assert_eq!(server.state(), ServerState::Starting);

    // Still booting: refused again, but no second start
    let reason = attempt_login(port, "Alex").await;
    assert!(reason.contains(LOGIN_STARTING));
    assert_eq!(harness.panel.starts.load(Ordering::SeqCst), 1);

    let status = query_status(port).await;
    assert_eq!(status["description"]["text"], "Lobby is starting, please wait");
}

#[tokio::test]
async fn test_login_without_auto_start_is_refused() {
    let port = free_port();
    let harness = Harness::start(vec![panel_server("survival", "Survival $ player-stop", port)], 2000).await;
    assert!(wait_for_port(port, Duration::from_secs(5)).await);

    for name in ["Steve", "Alex"] {
        let reason = attempt_login(port, name).await;
        assert!(reason.contains(LOGIN_OFFLINE));
    }
    assert_eq!(harness.panel.starts.load(Ordering::SeqCst), 0);

    let status = query_status(port).await;
    assert_eq!(status["description"]["text"], "Survival is offline");
}

#[tokio::test]
async fn test_unmanaged_servers_get_no_listener() {
    let port = free_port();
    let harness = Harness::start(vec![panel_server("plain", "Plain server", port)], 2000).await;

    assert!(harness.registry.is_empty());
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

// ============================================================================
// Forwarding
// ============================================================================

#[tokio::test]
async fn test_live_backend_is_forwarded() {
    let backend_port = spawn_game_backend().await;
    let (offset, public) = offset_for(backend_port);
    let harness = Harness::start(
        vec![panel_server(
            "lobby",
            "Lobby $ player-start&player-stop&update-port",
            public,
        )],
        offset,
    )
    .await;
    harness.panel.running.store(true, Ordering::SeqCst);
    assert!(wait_for_port(public, Duration::from_secs(5)).await);

    let server = harness.registry.get("lobby").unwrap();
    assert_eq!(server.game.internal, backend_port);

    // Port sync patched server.properties on the panel
    let props = harness.panel.files.lock().get("lobby/server.properties").cloned().unwrap();
    assert!(props.contains(&format!("server-port={}", backend_port)));

    let mut stream = TcpStream::connect(("127.0.0.1", public)).await.unwrap();
    stream.write_all(&handshake(public, NextState::Login)).await.unwrap();
    stream
        .write_all(
            &PlayerIdentity {
                name: "Steve".to_string(),
                id: None,
            }
            .encode(),
        )
        .await
        .unwrap();
    let (_, text) = read_text_packet(&mut stream).await;
    assert!(text.contains("Welcome Steve"));

    assert!(wait_until(|| server.active_players() == 1, Duration::from_secs(2)).await);
    assert_eq!(server.state(), ServerState::Running);

    drop(stream);
    assert!(wait_until(|| server.active_players() == 0, Duration::from_secs(2)).await);
    assert!(server.idle_stop_pending());
    assert_eq!(harness.panel.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_voice_datagrams_are_relayed() {
    let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend.local_addr().unwrap().port();
    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        while let Ok((n, from)) = backend.recv_from(&mut buf).await {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = backend.send_to(&buf[..n], from).await;
        }
    });

    let (offset, voice_public) = offset_for(backend_port);
    let game_public = loop {
        let candidate = free_port();
        if candidate > offset && candidate != voice_public {
            break candidate;
        }
    };
    let harness = Harness::start(
        vec![panel_server(
            "lobby",
            &format!("Lobby $ player-start&update-port&voice-port={}", voice_public),
            game_public,
        )],
        offset,
    )
    .await;
    assert!(wait_for_port(game_public, Duration::from_secs(5)).await);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut buf = [0u8; 64];
    for payload in [&b"voice-1"[..], &b"voice-2"[..]] {
        client.send_to(payload, ("127.0.0.1", voice_public)).await.unwrap();
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], payload);
    }
    assert_eq!(received.load(Ordering::SeqCst), 2);

    let props = harness
        .panel
        .files
        .lock()
        .get("lobby/config/voicechat/voicechat-server.properties")
        .cloned()
        .unwrap();
    assert!(props.contains(&format!("port={}", backend_port)));
}

// ============================================================================
// Discovery and shutdown
// ============================================================================

#[tokio::test]
async fn test_removed_server_closes_listener() {
    let port = free_port();
    let harness = Harness::start(vec![panel_server("lobby", "Lobby $ player-start", port)], 2000).await;
    assert!(wait_for_port(port, Duration::from_secs(5)).await);

    harness.panel.servers.lock().clear();
    let result = harness.discovery.discover().await.unwrap();
    assert_eq!(result.removed, vec!["Lobby"]);

    assert!(wait_for_port_closed(port, Duration::from_secs(5)).await);
    let registry = Arc::clone(&harness.registry);
    assert!(wait_until(|| registry.is_empty(), Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_update_event_spawns_new_gateway() {
    let first = free_port();
    let harness = Harness::start(vec![panel_server("lobby", "Lobby $ player-start", first)], 2000).await;

    let (tx, rx) = mpsc::channel::<PanelEvent>(4);
    let events = Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    }));
    let refresh = tokio::spawn(discovery::run_refresh_loop(
        Arc::clone(&harness.discovery),
        harness.ctx.clone(),
        events,
    ));

    let second = free_port();
    harness
        .panel
        .servers
        .lock()
        .push(panel_server("creative", "Creative $ player-stop", second));
    tx.send(PanelEvent::update()).await.unwrap();

    assert!(wait_for_port(second, Duration::from_secs(5)).await);
    assert_eq!(harness.registry.len(), 2);

    harness.shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), refresh)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_listeners() {
    let port = free_port();
    let harness = Harness::start(vec![panel_server("lobby", "Lobby $ player-start", port)], 2000).await;
    assert!(wait_for_port(port, Duration::from_secs(5)).await);

    harness.shutdown_tx.send(true).unwrap();
    assert!(wait_for_port_closed(port, Duration::from_secs(5)).await);
    let registry = Arc::clone(&harness.registry);
    assert!(wait_until(|| registry.is_empty(), Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_bind_conflict_is_an_error() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let panel = MockPanel::new(vec![panel_server("lobby", "Lobby $ player-start", port)]);
    let registry = ServerRegistry::new();
    let config = Arc::new(GatewayConfig {
        bind: "127.0.0.1".to_string(),
        ..GatewayConfig::default()
    });
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = GatewayContext {
        registry: Arc::clone(&registry),
        config: Arc::clone(&config),
        shutdown_rx,
    };
    let discovery = Discovery::new(panel, Arc::clone(&registry), config);
    discovery.discover().await.unwrap();

    let err = gateway::spawn_pending(&ctx).await.unwrap_err();
    assert!(err.to_string().contains("Failed to bind"));
}
