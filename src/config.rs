use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Panel API token (required)
pub const ENV_PANEL_KEY: &str = "CraftyKey";
/// Panel host name or address (required)
pub const ENV_PANEL_ADDR: &str = "CraftyAddr";
/// Address the public game ports bind to
pub const ENV_BIND_ADDR: &str = "ProxyAddr";
/// Port of the panel's HTTPS API
pub const ENV_PANEL_PORT: &str = "ProxyPort";
/// Minutes a server may stay empty before it is stopped
pub const ENV_IDLE_TIMEOUT: &str = "ProxyTimeout";
/// Optional TOML file with the full configuration
pub const ENV_CONFIG_FILE: &str = "ProxyConfig";

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// How to reach the control panel
    #[serde(default)]
    pub panel: PanelConfig,

    /// Listener and lifecycle tuning
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Deserialize, Clone)]
pub struct PanelConfig {
    /// Panel host (also used as the backend address for servers bound to loopback)
    #[serde(default)]
    pub address: String,

    /// Panel HTTPS API port (default: 443)
    #[serde(default = "default_panel_port")]
    pub port: u16,

    /// Bearer token for the panel API
    #[serde(default)]
    pub key: String,
}

impl std::fmt::Debug for PanelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanelConfig")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("key", &if self.key.is_empty() { "<unset>" } else { "<redacted>" })
            .finish()
    }
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: default_panel_port(),
            key: String::new(),
        }
    }
}

impl PanelConfig {
    /// Base URL of the REST API
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.address, self.port)
    }

    /// URL of the push-event websocket
    pub fn events_url(&self) -> String {
        format!("wss://{}:{}/ws", self.address, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Bind address for public game ports (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Distance between a public port and the backend port when remapping (default: 2000)
    #[serde(default = "default_port_offset")]
    pub port_offset: u16,

    /// Minutes without players before an auto-stop server is stopped (default: 5)
    #[serde(default = "default_idle_timeout_mins")]
    pub idle_timeout_mins: u64,

    /// Seconds a server may stay in Starting while the panel reports it down (default: 300)
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Timeout for the status ping against a backend (default: 3)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Timeout for dialing a backend before forwarding (default: 5)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Timeout for each read while answering a client offline (default: 10)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Seconds of silence before a voice session is dropped (default: 120)
    #[serde(default = "default_voice_session_idle")]
    pub voice_session_idle_secs: u64,

    /// Delay before reconnecting the panel event stream (default: 5)
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port_offset: default_port_offset(),
            idle_timeout_mins: default_idle_timeout_mins(),
            startup_timeout_secs: default_startup_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            voice_session_idle_secs: default_voice_session_idle(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

impl GatewayConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_mins * 60)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn voice_session_idle(&self) -> Duration {
        Duration::from_secs(self.voice_session_idle_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

// Default value functions
fn default_panel_port() -> u16 {
    443
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port_offset() -> u16 {
    2000
}

fn default_idle_timeout_mins() -> u64 {
    5
}

fn default_startup_timeout() -> u64 {
    300 // 5 minutes, modded servers boot slowly
}

fn default_probe_timeout() -> u64 {
    3
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_voice_session_idle() -> u64 {
    120
}

fn default_reconnect_delay() -> u64 {
    5
}

impl Config {
    /// Build the configuration from the process environment
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    ///
    /// If `ProxyConfig` names a file it is read first; the other variables
    /// then override whatever the file set.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(ENV_CONFIG_FILE).filter(|p| !p.is_empty()) {
            Some(path) => Self::parse_file(&path)?,
            None => Config::default(),
        };
        config.apply_overrides(&lookup);
        config.validate()?;
        Ok(config)
    }

    fn parse_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read configuration file {}: {}", path.display(), e)
        })?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    fn apply_overrides<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(ENV_PANEL_KEY) {
            self.panel.key = key;
        }
        if let Some(addr) = lookup(ENV_PANEL_ADDR) {
            self.panel.address = addr;
        }
        if let Some(bind) = lookup(ENV_BIND_ADDR).filter(|b| !b.is_empty()) {
            self.gateway.bind = bind;
        }
        if let Some(port) = parse_var(lookup, ENV_PANEL_PORT) {
            self.panel.port = port;
        }
        if let Some(mins) = parse_var(lookup, ENV_IDLE_TIMEOUT) {
            self.gateway.idle_timeout_mins = mins;
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.panel.key.trim().is_empty() {
            errors.push(format!("{} is not set", ENV_PANEL_KEY));
        }
        if self.panel.address.trim().is_empty() {
            errors.push(format!("{} is not set", ENV_PANEL_ADDR));
        }
        if self.panel.port == 0 {
            errors.push("panel port must be greater than 0".to_string());
        }
        if self.gateway.probe_timeout_secs == 0 {
            errors.push("probe_timeout_secs must be greater than 0".to_string());
        }
        if self.gateway.handshake_timeout_secs == 0 {
            errors.push("handshake_timeout_secs must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = key, value = %raw, "Ignoring unparseable value, using default");
            None
        }
    }
}
