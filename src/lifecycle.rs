//! Server lifecycle: state machine, panel start/stop and the liveness probe.

use crate::protocol;
use crate::server::{Runtime, ServerDescriptor};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle state of a server as seen by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    /// Not probed yet
    Unknown,
    /// The panel reports the server as not running
    Stopped,
    /// A start was issued and the backend is not answering yet
    Starting,
    /// Panel reports running and the backend answered a status ping
    Running,
    /// The server disappeared from the panel; terminal
    Removed,
}

impl ServerState {
    /// Whether `self -> next` is a legal edge. Staying in place is always
    /// allowed except that nothing leaves `Removed`.
    pub fn can_transition_to(self, next: ServerState) -> bool {
        use ServerState::*;
        match (self, next) {
            (Removed, _) => false,
            (_, Removed) => true,
            (a, b) if a == b => true,
            (Unknown, Stopped | Running) => true,
            (Stopped, Starting | Running) => true,
            (Starting, Running | Stopped) => true,
            (Running, Stopped) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Unknown => "unknown",
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Removed => "removed",
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Runtime {
    /// Apply a transition if legal. Returns false when it was rejected.
    pub(crate) fn set_state(&mut self, next: ServerState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        if self.state != next {
            self.state = next;
            self.state_since = Instant::now();
        }
        true
    }
}

impl ServerDescriptor {
    pub fn state(&self) -> ServerState {
        self.runtime.lock().state
    }

    pub fn is_removed(&self) -> bool {
        self.state() == ServerState::Removed
    }

    /// Move to `next` if the edge is legal
    pub fn transition(&self, next: ServerState) -> bool {
        let mut runtime = self.runtime.lock();
        let from = runtime.state;
        let applied = runtime.set_state(next);
        drop(runtime);

        if !applied {
            debug!(server = %self.name, from = %from, to = %next, "Rejected state transition");
        } else if from != next {
            info!(server = %self.name, from = %from, to = %next, "State changed");
        }
        applied
    }

    /// Ask the panel to start the server on behalf of `requester`.
    ///
    /// Does nothing unless the server is `Stopped` and no other start is in
    /// flight. The state only moves to `Starting` once the panel accepted.
    pub async fn start(&self, requester: &str) -> bool {
        {
            let mut runtime = self.runtime.lock();
            if runtime.state != ServerState::Stopped || runtime.start_pending {
                debug!(
                    server = %self.name,
                    requester,
                    state = %runtime.state,
                    "Start ignored"
                );
                return false;
            }
            runtime.start_pending = true;
        }

        let result = self.panel.start_server(&self.id).await;

        let mut runtime = self.runtime.lock();
        runtime.start_pending = false;
        match result {
            Ok(()) => {
                runtime.set_state(ServerState::Starting);
                drop(runtime);
                info!(server = %self.name, requester, "Server started by player");
                true
            }
            Err(e) => {
                drop(runtime);
                warn!(server = %self.name, requester, code = e.as_code(), error = %e, "Can't start server");
                false
            }
        }
    }

    /// Ask the panel to stop the server. The call is issued regardless of
    /// the current state; on success the state becomes `Stopped` unless the
    /// server was removed.
    pub async fn stop(&self) -> bool {
        match self.panel.stop_server(&self.id).await {
            Ok(()) => {
                self.transition(ServerState::Stopped);
                info!(server = %self.name, "Stopped server");
                true
            }
            Err(e) => {
                warn!(server = %self.name, code = e.as_code(), error = %e, "Can't stop server");
                false
            }
        }
    }

    /// Check whether the backend can take players right now.
    ///
    /// True only if the panel reports the server running and the backend
    /// answers a status request; the state then becomes `Running`. A "not
    /// running" answer moves the state to `Stopped`, except while a start is
    /// still within its startup window.
    pub async fn probe(&self) -> bool {
        let stats = match self.panel.server_stats(&self.id).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(server = %self.name, code = e.as_code(), error = %e, "Can't get server stats");
                return false;
            }
        };

        if !stats.running {
            self.observe_not_running();
            return false;
        }

        match protocol::ping_status(&self.backend_addr(), self.timings.probe_timeout).await {
            Ok(status) => {
                debug!(
                    server = %self.name,
                    version = ?status.version,
                    online = ?status.online_players,
                    "Backend answered status ping"
                );
                self.transition(ServerState::Running)
            }
            Err(e) => {
                debug!(server = %self.name, code = e.as_code(), error = %e, "Backend not answering yet");
                false
            }
        }
    }

    fn observe_not_running(&self) {
        let from = {
            let runtime = self.runtime.lock();
            let waited = runtime.state_since.elapsed();
            match runtime.state {
                ServerState::Stopped | ServerState::Removed => return,
                ServerState::Starting if waited < self.timings.startup_timeout => return,
                other => other,
            }
        };

        if from == ServerState::Starting {
            warn!(
                server = %self.name,
                timeout_secs = self.timings.startup_timeout.as_secs(),
                "Server did not come up in time, marking stopped"
            );
        }
        self.transition(ServerState::Stopped);
    }

    /// Flag the server as gone from the panel. Cancels a pending idle stop and
    /// wakes the listener so it can shut down.
    pub fn mark_removed(&self) {
        let mut runtime = self.runtime.lock();
        runtime.set_state(ServerState::Removed);
        if let Some(pending) = runtime.idle_stop.take() {
            pending.task.abort();
        }
        drop(runtime);

        info!(server = %self.name, id = %self.id, "Server removed from panel");
        self.signal_removed();
    }
}
