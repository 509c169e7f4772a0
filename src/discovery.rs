//! Server discovery and the event-driven refresh loop.

use crate::config::GatewayConfig;
use crate::gateway::{self, GatewayContext};
use crate::panel::{PanelEvent, SharedPanel};
use crate::registry::ServerRegistry;
use crate::remap;
use crate::server::{ServerDescriptor, ServerTimings};
use futures::{Stream, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one discovery pass changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiscoveryResult {
    /// Names of servers added to the registry
    pub added: Vec<String>,
    /// Names of servers flagged as removed
    pub removed: Vec<String>,
    /// Servers the panel listed, managed or not
    pub listed: usize,
}

pub struct Discovery {
    panel: SharedPanel,
    registry: Arc<ServerRegistry>,
    config: Arc<GatewayConfig>,
}

impl Discovery {
    pub fn new(panel: SharedPanel, registry: Arc<ServerRegistry>, config: Arc<GatewayConfig>) -> Arc<Self> {
        Arc::new(Self {
            panel,
            registry,
            config,
        })
    }

    /// List the panel's servers and merge them into the registry by id.
    ///
    /// New managed servers get their ports synced and an initial probe;
    /// known servers keep their descriptor. Registered servers the panel no
    /// longer lists are flagged as removed.
    pub async fn discover(&self) -> anyhow::Result<DiscoveryResult> {
        let records = self
            .panel
            .list_servers()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to list servers: {}", e))?;

        let mut result = DiscoveryResult {
            listed: records.len(),
            ..Default::default()
        };
        let listed: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let timings = ServerTimings::from_config(&self.config);

        for record in &records {
            if self.registry.contains(&record.id) {
                continue;
            }
            let server = ServerDescriptor::from_panel(
                record,
                Arc::clone(&self.panel),
                self.config.port_offset,
                timings,
            );
            if !server.is_managed() {
                debug!(server = %server.name, id = %server.id, "Skipping unmanaged server");
                continue;
            }

            remap::sync_ports(&server).await;
            server.probe().await;

            let name = server.name.clone();
            if self.registry.add(server) {
                result.added.push(name);
            }
        }

        for server in self.registry.snapshot() {
            if listed.contains(server.id.as_str()) || server.is_removed() {
                continue;
            }
            server.mark_removed();
            // Without a listener nobody else would evict it
            if !server.is_handled() {
                self.registry.remove(&server);
            }
            result.removed.push(server.name.clone());
        }

        info!(
            listed = result.listed,
            managed = self.registry.len(),
            added = result.added.len(),
            removed = result.removed.len(),
            "Discovery finished"
        );
        Ok(result)
    }
}

/// Rediscover and bind listeners for whatever is new.
///
/// A failed panel listing is logged and skipped; a failed bind is returned.
pub async fn refresh(discovery: &Discovery, ctx: &GatewayContext) -> anyhow::Result<usize> {
    if let Err(e) = discovery.discover().await {
        warn!(error = %e, "Rediscovery failed");
        return Ok(0);
    }
    let spawned = gateway::spawn_pending(ctx).await?;
    if spawned > 0 {
        info!(count = spawned, "Found new servers");
    }
    Ok(spawned)
}

/// React to panel push events until shutdown or until the stream ends.
pub async fn run_refresh_loop<S>(
    discovery: Arc<Discovery>,
    ctx: GatewayContext,
    mut events: S,
) -> anyhow::Result<()>
where
    S: Stream<Item = PanelEvent> + Unpin,
{
    let mut shutdown_rx = ctx.shutdown_rx.clone();

    loop {
        tokio::select! {
            event = events.next() => {
                match event {
                    Some(event) if event.is_update() => {
                        debug!("Panel reported an update");
                        refresh(&discovery, &ctx).await?;
                    }
                    Some(event) => {
                        debug!(event = %event.event, "Ignoring panel event");
                    }
                    None => {
                        warn!("Panel event stream ended");
                        return Ok(());
                    }
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Refresh loop shutting down");
                    return Ok(());
                }
            }
        }
    }
}
