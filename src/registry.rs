//! In-memory set of known servers, keyed by panel id.

use crate::server::ServerDescriptor;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Registry of server descriptors.
///
/// Safe to mutate while other tasks iterate a [`snapshot`](Self::snapshot).
#[derive(Default)]
pub struct ServerRegistry {
    servers: DashMap<String, Arc<ServerDescriptor>>,
}

impl ServerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert a descriptor. Returns false if the id is already known.
    pub fn add(&self, server: Arc<ServerDescriptor>) -> bool {
        match self.servers.entry(server.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(server = %server.name, id = %server.id, "Registered server");
                slot.insert(server);
                true
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<ServerDescriptor>> {
        self.servers.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.servers.contains_key(id)
    }

    /// Remove `server` by id, but only if the registered entry is this very
    /// descriptor and not a newer one with the same id.
    pub fn remove(&self, server: &Arc<ServerDescriptor>) -> bool {
        let removed = self
            .servers
            .remove_if(&server.id, |_, current| Arc::ptr_eq(current, server))
            .is_some();
        if removed {
            debug!(server = %server.name, id = %server.id, "Unregistered server");
        }
        removed
    }

    /// Point-in-time copy of all descriptors
    pub fn snapshot(&self) -> Vec<Arc<ServerDescriptor>> {
        self.servers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Descriptors no listener has picked up yet
    pub fn unhandled(&self) -> Vec<Arc<ServerDescriptor>> {
        self.snapshot()
            .into_iter()
            .filter(|server| !server.is_handled())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
