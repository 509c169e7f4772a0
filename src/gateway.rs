//! Public listener for one server.
//!
//! Each managed server gets a TCP listener on its public port (and a UDP
//! voice relay when configured). Connections are forwarded when the backend
//! is live and answered locally otherwise.

use crate::config::GatewayConfig;
use crate::forward;
use crate::handshake;
use crate::registry::ServerRegistry;
use crate::server::ServerDescriptor;
use crate::voice::VoiceRelay;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const MAX_DATAGRAM: usize = 65_535;

/// Shared pieces every listener needs
#[derive(Clone)]
pub struct GatewayContext {
    pub registry: Arc<ServerRegistry>,
    pub config: Arc<GatewayConfig>,
    pub shutdown_rx: watch::Receiver<bool>,
}

pub struct Gateway {
    server: Arc<ServerDescriptor>,
    listener: TcpListener,
    voice: Option<Arc<VoiceRelay>>,
    ctx: GatewayContext,
}

impl Gateway {
    /// Bind the public ports for `server`. The caller must have claimed it
    /// with [`ServerDescriptor::mark_handled`].
    pub async fn bind(server: Arc<ServerDescriptor>, ctx: GatewayContext) -> anyhow::Result<Self> {
        let bind = ctx.config.bind.as_str();
        let listener = TcpListener::bind((bind, server.game.public))
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to bind {}:{} for {}: {}",
                    bind,
                    server.game.public,
                    server.name,
                    e
                )
            })?;

        let voice = match (server.voice, server.voice_backend_addr()) {
            (Some(ports), Some(backend)) => {
                let relay = VoiceRelay::bind(
                    &server.name,
                    bind,
                    ports.public,
                    backend,
                    ctx.config.voice_session_idle(),
                )
                .await
                .map_err(|e| {
                    anyhow::anyhow!(
                        "Failed to bind voice port {}:{} for {}: {}",
                        bind,
                        ports.public,
                        server.name,
                        e
                    )
                })?;
                Some(relay)
            }
            _ => None,
        };

        info!(
            server = %server.name,
            id = %server.id,
            port = server.game.public,
            backend = %server.backend_addr(),
            voice_port = ?server.voice.map(|v| v.public),
            auto_start = server.options.auto_start,
            auto_stop = server.options.auto_stop,
            state = %server.state(),
            "Gateway listening"
        );

        Ok(Self {
            server,
            listener,
            voice,
            ctx,
        })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let name = self.server.name.clone();
            if let Err(e) = self.run().await {
                error!(server = %name, error = %e, "Gateway error");
            }
        })
    }

    /// Accept until the server is removed or shutdown is signalled. The
    /// descriptor is evicted from the registry on the way out.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut shutdown_rx = self.ctx.shutdown_rx.clone();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let server = Arc::clone(&self.server);
                            let config = Arc::clone(&self.ctx.config);
                            tokio::spawn(async move {
                                handle_connection(stream, addr, server, config).await;
                            });
                        }
                        Err(e) => {
                            error!(server = %self.server.name, error = %e, "Failed to accept connection");
                        }
                    }
                }
                result = recv_voice(self.voice.as_ref(), &mut buf) => {
                    match (result, self.voice.as_ref()) {
                        (Ok((n, from)), Some(relay)) => {
                            if let Err(e) = relay.handle_datagram(&buf[..n], from).await {
                                debug!(server = %self.server.name, client = %from, error = %e, "Voice datagram dropped");
                            }
                        }
                        (Err(e), _) => {
                            warn!(server = %self.server.name, error = %e, "Voice socket error");
                        }
                        (Ok(_), None) => {}
                    }
                }
                _ = self.server.removed_signal() => {}
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!(server = %self.server.name, "Gateway shutting down");
                        break;
                    }
                }
            }

            if self.server.is_removed() {
                info!(server = %self.server.name, port = self.server.game.public, "Server removed, closing gateway");
                break;
            }
        }

        if let Some(relay) = &self.voice {
            relay.shutdown();
        }
        self.ctx.registry.remove(&self.server);
        Ok(())
    }
}

async fn recv_voice(
    relay: Option<&Arc<VoiceRelay>>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match relay {
        Some(relay) => relay.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    server: Arc<ServerDescriptor>,
    config: Arc<GatewayConfig>,
) {
    debug!(server = %server.name, client = %addr, "Connection accepted");

    if server.probe().await {
        match forward::splice(stream, &server, config.connect_timeout()).await {
            Ok(stats) => debug!(
                server = %server.name,
                client = %addr,
                client_to_backend = stats.client_to_backend,
                backend_to_client = stats.backend_to_client,
                "Forwarded connection finished"
            ),
            Err(e) => warn!(
                server = %server.name,
                client = %addr,
                backend = %server.backend_addr(),
                error = %e,
                "Can't reach backend"
            ),
        }
        return;
    }

    if let Err(e) = handshake::simulate(&mut stream, &server, config.handshake_timeout()).await {
        if e.is_disconnect() {
            debug!(server = %server.name, client = %addr, "Client hung up during handshake");
        } else {
            debug!(server = %server.name, client = %addr, code = e.as_code(), error = %e, "Handshake failed");
        }
    }
}

/// Bind listeners for every registered server nobody handles yet.
///
/// Each descriptor is claimed before binding, so concurrent refreshes never
/// bind the same server twice. A bind failure releases the claim and is
/// returned as an error; callers treat it as fatal.
pub async fn spawn_pending(ctx: &GatewayContext) -> anyhow::Result<usize> {
    let mut spawned = 0;
    for server in ctx.registry.unhandled() {
        if server.is_removed() {
            ctx.registry.remove(&server);
            continue;
        }
        // Another refresh claimed it after our snapshot
        if server.mark_handled() {
            continue;
        }
        match Gateway::bind(Arc::clone(&server), ctx.clone()).await {
            Ok(gateway) => {
                gateway.spawn();
                spawned += 1;
            }
            Err(e) => {
                server.release_handled();
                return Err(e);
            }
        }
    }
    Ok(spawned)
}
