//! Patching backend property files so servers listen on their internal ports.

use crate::server::ServerDescriptor;
use tracing::{info, warn};

pub const SERVER_PROPERTIES: &str = "server.properties";
pub const VOICE_PROPERTIES: &str = "config/voicechat/voicechat-server.properties";

/// Content used when a server has no `server.properties` yet
pub const DEFAULT_SERVER_PROPERTIES: &str = "\
allow-flight=true
allow-nether=true
broadcast-console-to-ops=true
broadcast-rcon-to-ops=true
difficulty=normal
enable-command-block=false
enable-jmx-monitoring=false
enable-query=false
enable-rcon=false
enable-status=true
enforce-secure-profile=true
enforce-whitelist=false
entity-broadcast-range-percentage=100
force-gamemode=false
function-permission-level=2
gamemode=survival
generate-structures=true
generator-settings={}
hardcore=false
hide-online-players=false
initial-disabled-packs=
initial-enabled-packs=vanilla
level-name=world
level-seed=
level-type=minecraft\\:normal
max-chained-neighbor-updates=1000000
max-players=20
max-tick-time=60000
max-world-size=29999984
motd=A Minecraft Server
network-compression-threshold=256
online-mode=true
op-permission-level=4
player-idle-timeout=0
prevent-proxy-connections=false
pvp=true
query.port=25565
rate-limit=0
rcon.password=
rcon.port=25575
require-resource-pack=false
resource-pack=
resource-pack-prompt=
resource-pack-sha1=
server-ip=
server-port=25565
simulation-distance=10
spawn-animals=true
spawn-monsters=true
spawn-npcs=true
spawn-protection=16
sync-chunk-writes=true
text-filtering-config=
use-native-transport=true
view-distance=10
white-list=false
";

/// Content used when the voice chat mod has not written its config yet
pub const DEFAULT_VOICE_PROPERTIES: &str = "port=24454\n";

/// Set `key=value`, replacing every line that starts with `key=` and
/// appending the pair when no such line exists. Comments are left alone.
pub fn rewrite_property(text: &str, key: &str, value: &str) -> String {
    let prefix = format!("{}=", key);
    let replacement = format!("{}{}", prefix, value);
    let mut found = false;

    let mut lines: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim_start().starts_with(&prefix) {
            found = true;
            lines.push(&replacement);
        } else {
            lines.push(line);
        }
    }
    if !found {
        lines.push(&replacement);
    }

    let mut out = lines.join("\n");
    if text.ends_with('\n') || !found || text.is_empty() {
        out.push('\n');
    }
    out
}

/// Value of the first `key=` line, if any
pub fn property_value<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let prefix = format!("{}=", key);
    text.lines()
        .map(str::trim_start)
        .find_map(|line| line.strip_prefix(prefix.as_str()))
        .map(str::trim_end)
}

pub fn rewrite_server_properties(text: &str, port: u16) -> String {
    let port = port.to_string();
    let text = rewrite_property(text, "server-port", &port);
    rewrite_property(&text, "query.port", &port)
}

pub fn rewrite_voice_properties(text: &str, port: u16) -> String {
    rewrite_property(text, "port", &port.to_string())
}

/// Push the internal ports into the backend's property files.
///
/// Best effort: failures are logged and the descriptor stays usable.
pub async fn sync_ports(server: &ServerDescriptor) {
    if !server.remap {
        return;
    }

    if server.is_managed() {
        let port = server.game.internal;
        update_file(server, SERVER_PROPERTIES, DEFAULT_SERVER_PROPERTIES, |text| {
            rewrite_server_properties(text, port)
        })
        .await;
    }

    if let Some(voice) = server.voice {
        update_file(server, VOICE_PROPERTIES, DEFAULT_VOICE_PROPERTIES, |text| {
            rewrite_voice_properties(text, voice.internal)
        })
        .await;
    }
}

async fn update_file<F>(server: &ServerDescriptor, path: &str, default: &str, rewrite: F)
where
    F: FnOnce(&str) -> String,
{
    let current = match server.panel.read_file(&server.id, path, default).await {
        Ok(text) => text,
        Err(e) => {
            warn!(server = %server.name, file = path, error = %e, "Can't read file for port update");
            return;
        }
    };

    let updated = rewrite(&current);
    if updated == current {
        return;
    }

    match server.panel.write_file(&server.id, path, &updated).await {
        Ok(()) => info!(server = %server.name, file = path, "Updated ports"),
        Err(e) => warn!(server = %server.name, file = path, error = %e, "Can't update file"),
    }
}
