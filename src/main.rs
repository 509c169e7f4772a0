use craftgate::config::Config;
use craftgate::discovery::{self, Discovery};
use craftgate::gateway::{self, GatewayContext};
use craftgate::panel::PanelClient;
use craftgate::registry::ServerRegistry;
use craftgate::{PKG_NAME, VERSION};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("craftgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    let panel = Arc::new(PanelClient::new(&config.panel).map_err(|e| {
        error!(error = %e, "Failed to create panel client");
        anyhow::anyhow!("Failed to create panel client: {}", e)
    })?);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = ServerRegistry::new();
    let gateway_config = Arc::new(config.gateway.clone());
    let ctx = GatewayContext {
        registry: Arc::clone(&registry),
        config: Arc::clone(&gateway_config),
        shutdown_rx: shutdown_rx.clone(),
    };

    // Initial discovery and listeners; failures here are fatal
    let discovery = Discovery::new(panel.clone(), Arc::clone(&registry), gateway_config);
    let result = discovery.discover().await.map_err(|e| {
        error!(error = %e, "Initial discovery failed");
        e
    })?;
    info!(servers = ?result.added, "Found servers");

    let spawned = gateway::spawn_pending(&ctx).await.map_err(|e| {
        error!(error = %e, "Failed to start gateway");
        e
    })?;
    info!(listeners = spawned, "Gateways started");

    // Follow panel push events
    let events = panel.subscribe(config.gateway.reconnect_delay());
    let mut refresh_handle = tokio::spawn(discovery::run_refresh_loop(
        Arc::clone(&discovery),
        ctx.clone(),
        events,
    ));

    // Wait for shutdown signal (Ctrl+C or SIGTERM), rediscover on SIGHUP
    let mut exit_error = None;

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, rediscovering servers...");
                    if let Err(e) = discovery::refresh(&discovery, &ctx).await {
                        error!(error = %e, "Failed to start gateway");
                        exit_error = Some(e);
                        break;
                    }
                }
                joined = &mut refresh_handle => {
                    if let Some(e) = refresh_exit(joined) {
                        exit_error = Some(e);
                    }
                    break;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, shutting down...");
            }
            joined = &mut refresh_handle => {
                exit_error = refresh_exit(joined);
            }
        }
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Give listeners a moment to close their ports
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        while !registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    refresh_handle.abort();

    match exit_error {
        Some(e) => Err(e),
        None => {
            info!("Shutdown complete");
            Ok(())
        }
    }
}

/// Interpret the end of the refresh loop. Only a failed listener bind is
/// fatal; an ended event stream just stops live discovery.
fn refresh_exit(
    joined: Result<anyhow::Result<()>, tokio::task::JoinError>,
) -> Option<anyhow::Error> {
    match joined {
        Ok(Ok(())) => {
            info!("Live discovery stopped");
            None
        }
        Ok(Err(e)) => {
            error!(error = %e, "Failed to start gateway");
            Some(e)
        }
        Err(e) => {
            error!(error = %e, "Refresh loop panicked");
            Some(anyhow::anyhow!("Refresh loop panicked: {}", e))
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        panel = %config.panel.base_url(),
        events = %config.panel.events_url(),
        "Panel settings"
    );
    info!(
        bind = %config.gateway.bind,
        port_offset = config.gateway.port_offset,
        idle_timeout_mins = config.gateway.idle_timeout_mins,
        startup_timeout_secs = config.gateway.startup_timeout_secs,
        "Gateway settings"
    );
    info!(
        probe_timeout_secs = config.gateway.probe_timeout_secs,
        connect_timeout_secs = config.gateway.connect_timeout_secs,
        handshake_timeout_secs = config.gateway.handshake_timeout_secs,
        voice_session_idle_secs = config.gateway.voice_session_idle_secs,
        reconnect_delay_secs = config.gateway.reconnect_delay_secs,
        "Timeouts"
    );
}
