//! Answers clients on behalf of a backend that is not running.
//!
//! Status pings get a description reflecting the server state; logins are
//! always refused here, and with auto-start they trigger a start first.

use crate::error::ProtocolError;
use crate::lifecycle::ServerState;
use crate::protocol::{self, packet_id, ClientIntent, Reader};
use crate::server::ServerDescriptor;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Version name reported while the backend is offline
pub const OFFLINE_VERSION_NAME: &str = "craftgate";

pub const LOGIN_STARTING: &str = "Server is starting, please reconnect in a minute";
pub const LOGIN_OFFLINE: &str = "Server is offline, ask the owner to start it";
pub const LOGIN_UNAVAILABLE: &str = "Server could not be started right now, try again later";

/// Server-list description for a server that is not running
pub fn status_description(name: &str, state: ServerState, auto_start: bool) -> String {
    match state {
        ServerState::Starting => format!("{} is starting, please wait", name),
        _ if auto_start => format!("{} is stopped, you can start it by joining", name),
        _ => format!("{} is offline", name),
    }
}

/// Disconnect reason for a refused login. `starting` is true when this
/// login started the server or a start is already under way.
pub fn login_refusal(auto_start: bool, starting: bool) -> &'static str {
    match (auto_start, starting) {
        (_, true) => LOGIN_STARTING,
        (true, false) => LOGIN_UNAVAILABLE,
        (false, false) => LOGIN_OFFLINE,
    }
}

async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, ProtocolError>
where
    F: std::future::Future<Output = Result<T, ProtocolError>>,
{
    tokio::time::timeout(deadline, fut).await?
}

/// Serve one client connection while the backend is down.
///
/// Each read is bounded by `read_timeout`. The connection is meant to be
/// closed by the caller afterwards.
pub async fn simulate<S>(
    stream: &mut S,
    server: &Arc<ServerDescriptor>,
    read_timeout: Duration,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let intent = with_deadline(read_timeout, protocol::read_intent(stream)).await?;

    match intent {
        ClientIntent::StatusQuery { protocol_version } => {
            let request = with_deadline(read_timeout, protocol::read_packet(stream)).await?;
            if request.id != packet_id::STATUS_REQUEST {
                return Err(ProtocolError::UnexpectedPacket(request.id));
            }

            let description =
                status_description(&server.name, server.state(), server.options.auto_start);
            stream
                .write_all(&protocol::status_response(
                    protocol_version,
                    OFFLINE_VERSION_NAME,
                    &description,
                ))
                .await?;
            stream.flush().await?;

            let ping = match with_deadline(read_timeout, protocol::read_packet(stream)).await {
                Ok(ping) => ping,
                // Clients may close right after reading the status
                Err(e) if e.is_disconnect() => return Ok(()),
                Err(e) => return Err(e),
            };
            if ping.id != packet_id::PING {
                return Err(ProtocolError::UnexpectedPacket(ping.id));
            }
            let payload = Reader::new(&ping.body).i64()?;
            stream.write_all(&protocol::pong(payload)).await?;
            stream.flush().await?;
            debug!(server = %server.name, "Answered status ping while offline");
        }
        ClientIntent::LoginAttempt { player, .. } => {
            info!(
                server = %server.name,
                player = %player.name,
                player_id = ?player.id,
                state = %server.state(),
                "Login while server is not running"
            );
            let started = server.options.auto_start && server.start(&player.name).await;
            // The player may never come back; stop the server if nobody joins
            if started && server.options.auto_stop {
                server.arm_idle_stop();
            }
            let starting = started || server.state() == ServerState::Starting;
            stream
                .write_all(&protocol::login_disconnect(login_refusal(
                    server.options.auto_start,
                    starting,
                )))
                .await?;
            stream.flush().await?;
        }
        ClientIntent::RawStream => {
            debug!(server = %server.name, "Closing legacy or unknown connection while offline");
        }
    }

    Ok(())
}
