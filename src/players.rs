//! Player counting and the deferred idle stop.

use crate::lifecycle::ServerState;
use crate::server::{Runtime, ScheduledStop, ServerDescriptor};
use std::sync::Arc;
use tracing::{debug, info};

impl ServerDescriptor {
    pub fn active_players(&self) -> usize {
        self.runtime.lock().active_players
    }

    /// Whether an idle stop is currently scheduled
    pub fn idle_stop_pending(&self) -> bool {
        self.runtime.lock().idle_stop.is_some()
    }

    /// Register a connected player. With auto-stop, cancels any pending stop.
    pub fn increment_players(&self) -> usize {
        let mut runtime = self.runtime.lock();
        runtime.active_players += 1;
        let players = runtime.active_players;
        if self.options.auto_stop {
            if let Some(pending) = runtime.idle_stop.take() {
                pending.task.abort();
                debug!(server = %self.name, "Cancelled idle stop");
            }
        }
        drop(runtime);

        info!(server = %self.name, players, "Player connected");
        players
    }

    /// Unregister a player. The count never goes below zero; reaching zero
    /// with auto-stop (re)schedules a stop after the idle timeout.
    pub fn decrement_players(self: &Arc<Self>) -> usize {
        let mut runtime = self.runtime.lock();
        runtime.active_players = runtime.active_players.saturating_sub(1);
        let players = runtime.active_players;

        let schedule = players == 0 && self.schedule_idle_stop(&mut runtime);
        drop(runtime);

        info!(server = %self.name, players, "Player disconnected");
        if schedule {
            info!(
                server = %self.name,
                minutes = self.timings.idle_timeout.as_secs() / 60,
                "Stopping server after idle timeout"
            );
        }
        players
    }

    /// Arm the idle stop while nobody is connected, e.g. right after a
    /// login started the server. A player joining cancels it as usual.
    pub fn arm_idle_stop(self: &Arc<Self>) -> bool {
        let mut runtime = self.runtime.lock();
        let armed = runtime.active_players == 0 && self.schedule_idle_stop(&mut runtime);
        drop(runtime);

        if armed {
            info!(
                server = %self.name,
                minutes = self.timings.idle_timeout.as_secs() / 60,
                "Stopping server after idle timeout unless a player joins"
            );
        }
        armed
    }

    /// Start a fresh countdown, replacing any pending one. Must be called
    /// with the descriptor lock held.
    fn schedule_idle_stop(self: &Arc<Self>, runtime: &mut Runtime) -> bool {
        if !self.options.auto_stop || runtime.state == ServerState::Removed {
            return false;
        }
        runtime.idle_generation += 1;
        let generation = runtime.idle_generation;
        let idle = self.timings.idle_timeout;
        let server = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if server.claim_idle_stop(generation) {
                server.stop().await;
            }
        });
        if let Some(previous) = runtime.idle_stop.replace(ScheduledStop { generation, task }) {
            previous.task.abort();
        }
        true
    }

    /// Called by the timer task when it fires. Only the most recent schedule
    /// may proceed, and only while the server is still empty.
    fn claim_idle_stop(&self, generation: u64) -> bool {
        let mut runtime = self.runtime.lock();
        let current = matches!(&runtime.idle_stop, Some(s) if s.generation == generation);
        if !current || runtime.active_players > 0 {
            return false;
        }
        runtime.idle_stop = None;
        true
    }
}

/// Counts one player for as long as it is alive
pub struct PlayerGuard {
    server: Arc<ServerDescriptor>,
}

impl PlayerGuard {
    pub fn join(server: &Arc<ServerDescriptor>) -> Self {
        server.increment_players();
        Self {
            server: Arc::clone(server),
        }
    }
}

impl Drop for PlayerGuard {
    fn drop(&mut self) {
        self.server.decrement_players();
    }
}
