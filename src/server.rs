//! Per-server descriptor built from a panel record.
//!
//! Policy flags are encoded in the panel's server name:
//! `"<name> $ <opt1>&<opt2>=<value>&..."`.

use crate::config::GatewayConfig;
use crate::lifecycle::ServerState;
use crate::panel::{PanelServer, SharedPanel};
use parking_lot::Mutex;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

const OPT_PLAYER_START: &str = "player-start";
const OPT_PLAYER_STOP: &str = "player-stop";
const OPT_UPDATE_PORT: &str = "update-port";
const OPT_VOICE_PORT: &str = "voice-port";

/// Where the voice channel listens publicly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoicePort {
    /// `voice-port=-1`: same number as the game port
    SameAsGame,
    Port(u16),
}

/// Flags parsed from the server name
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerOptions {
    /// Start the server when a player tries to join
    pub auto_start: bool,
    /// Stop the server after the last player left and the idle timeout passed
    pub auto_stop: bool,
    /// Move the backend to `public - offset` and patch its properties
    pub remap_ports: bool,
    pub voice: Option<VoicePort>,
}

impl ServerOptions {
    /// Split an encoded panel name into the display name and its options.
    ///
    /// Without a `$` the raw name is returned untouched and no option is set.
    /// Unknown or malformed option tokens are ignored.
    pub fn parse(raw: &str) -> (String, ServerOptions) {
        let Some((name, encoded)) = raw.split_once('$') else {
            return (raw.to_string(), ServerOptions::default());
        };

        let mut options = ServerOptions::default();
        for token in encoded.split('&').map(str::trim).filter(|t| !t.is_empty()) {
            match token.split_once('=') {
                None if token == OPT_PLAYER_START => options.auto_start = true,
                None if token == OPT_PLAYER_STOP => options.auto_stop = true,
                None if token == OPT_UPDATE_PORT => options.remap_ports = true,
                Some((key, value)) if key.trim() == OPT_VOICE_PORT => {
                    match value.trim().parse::<i32>() {
                        Ok(-1) => options.voice = Some(VoicePort::SameAsGame),
                        Ok(port) if port > 0 && port <= u16::MAX as i32 => {
                            options.voice = Some(VoicePort::Port(port as u16))
                        }
                        _ => warn!(name = %raw, option = token, "Ignoring invalid voice port"),
                    }
                }
                _ => {}
            }
        }

        (name.trim().to_string(), options)
    }
}

/// A public port and the backend port it leads to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMap {
    pub public: u16,
    pub internal: u16,
}

impl PortMap {
    pub fn new(public: u16, offset: u16, remap: bool) -> Option<Self> {
        let internal = if remap {
            public.checked_sub(offset).filter(|p| *p > 0)?
        } else {
            public
        };
        Some(Self { public, internal })
    }
}

/// Timing knobs copied from configuration
#[derive(Debug, Clone, Copy)]
pub struct ServerTimings {
    pub idle_timeout: Duration,
    pub startup_timeout: Duration,
    pub probe_timeout: Duration,
}

impl ServerTimings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            startup_timeout: config.startup_timeout(),
            probe_timeout: config.probe_timeout(),
        }
    }
}

/// A deferred stop scheduled after the last player left
pub(crate) struct ScheduledStop {
    pub(crate) generation: u64,
    pub(crate) task: JoinHandle<()>,
}

/// Mutable per-server state, always accessed under the descriptor lock
pub(crate) struct Runtime {
    pub(crate) state: ServerState,
    pub(crate) state_since: Instant,
    pub(crate) active_players: usize,
    pub(crate) start_pending: bool,
    pub(crate) idle_generation: u64,
    pub(crate) idle_stop: Option<ScheduledStop>,
}

/// Everything the gateway knows about one panel server
pub struct ServerDescriptor {
    pub id: String,
    pub name: String,
    /// Host the backend listens on
    pub address: String,
    pub game: PortMap,
    pub voice: Option<PortMap>,
    pub options: ServerOptions,
    /// Whether the ports are actually remapped (may be off even if requested)
    pub remap: bool,
    pub(crate) panel: SharedPanel,
    pub(crate) timings: ServerTimings,
    pub(crate) runtime: Mutex<Runtime>,
    handled: AtomicBool,
    removed: Notify,
}

impl ServerDescriptor {
    /// Build a descriptor from a panel record. Ports are computed here and
    /// never change afterwards.
    pub fn from_panel(
        record: &PanelServer,
        panel: SharedPanel,
        port_offset: u16,
        timings: ServerTimings,
    ) -> Arc<Self> {
        let (name, options) = ServerOptions::parse(&record.name);

        let voice_public = options.voice.map(|v| match v {
            VoicePort::SameAsGame => record.port,
            VoicePort::Port(port) => port,
        });

        let mut remap = options.remap_ports;
        if remap {
            let game_ok = PortMap::new(record.port, port_offset, true).is_some();
            let voice_ok = voice_public
                .map(|p| PortMap::new(p, port_offset, true).is_some())
                .unwrap_or(true);
            if !game_ok || !voice_ok {
                warn!(
                    server = %name,
                    port = record.port,
                    voice_port = ?voice_public,
                    offset = port_offset,
                    "Port is below the remap offset, remapping disabled"
                );
                remap = false;
            }
        }

        // Without remap the maps always exist; with remap both were checked above
        let game = PortMap::new(record.port, port_offset, remap).unwrap_or(PortMap {
            public: record.port,
            internal: record.port,
        });
        let voice = voice_public.map(|public| {
            PortMap::new(public, port_offset, remap).unwrap_or(PortMap {
                public,
                internal: public,
            })
        });

        let address = match record.ip.parse::<IpAddr>() {
            Ok(ip) if ip.is_loopback() => panel.host().to_string(),
            _ => record.ip.clone(),
        };

        Arc::new(Self {
            id: record.id.clone(),
            name,
            address,
            game,
            voice,
            options,
            remap,
            panel,
            timings,
            runtime: Mutex::new(Runtime {
                state: ServerState::Unknown,
                state_since: Instant::now(),
                active_players: 0,
                start_pending: false,
                idle_generation: 0,
                idle_stop: None,
            }),
            handled: AtomicBool::new(false),
            removed: Notify::new(),
        })
    }

    /// Servers without auto-start or auto-stop are left alone
    pub fn is_managed(&self) -> bool {
        self.options.auto_start || self.options.auto_stop
    }

    /// Backend game address, `address:internal`
    pub fn backend_addr(&self) -> String {
        format!("{}:{}", self.address, self.game.internal)
    }

    pub fn voice_backend_addr(&self) -> Option<String> {
        self.voice
            .map(|v| format!("{}:{}", self.address, v.internal))
    }

    /// Mark that a listener owns this descriptor. Returns the previous value.
    pub fn mark_handled(&self) -> bool {
        self.handled.swap(true, Ordering::SeqCst)
    }

    /// Give up a claim after the listener could not be bound
    pub(crate) fn release_handled(&self) {
        self.handled.store(false, Ordering::SeqCst);
    }

    pub fn is_handled(&self) -> bool {
        self.handled.load(Ordering::SeqCst)
    }

    /// Wake the listener waiting in [`removed_signal`](Self::removed_signal)
    pub(crate) fn signal_removed(&self) {
        self.removed.notify_one();
    }

    /// Resolves once the descriptor was flagged as removed
    pub async fn removed_signal(&self) {
        self.removed.notified().await
    }
}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}->{})", self.name, self.game.public, self.game.internal)
    }
}

impl fmt::Debug for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("game", &self.game)
            .field("voice", &self.voice)
            .field("options", &self.options)
            .field("remap", &self.remap)
            .finish()
    }
}
