//! Live connection tracking.
//!
//! Every mutation and the published count happen under one lock. The count
//! is broadcast through a `watch` channel, so [`ConnectionRegistry::wait_empty`]
//! sleeps until the registry drains instead of polling it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::pump::{ConnectionId, ConnectionPump};

/// Registry of open connections, keyed by [`ConnectionId`].
///
/// Cheap to clone. A connection added here removes itself when it closes.
#[derive(Clone)]
pub struct ConnectionRegistry {
    shared: Arc<RegistryShared>,
}

pub(crate) struct RegistryShared {
    connections: Mutex<Connections>,
    count: watch::Sender<usize>,
}

#[derive(Default)]
struct Connections {
    live: HashMap<ConnectionId, ConnectionPump>,
    /// Set once draining starts; no connection is added after that.
    draining: bool,
}

impl RegistryShared {
    /// Remove a connection. Unknown ids are ignored.
    pub(crate) fn detach(&self, id: &ConnectionId) -> Option<ConnectionPump> {
        let mut connections = self.connections.lock();
        let removed = connections.live.remove(id);
        if removed.is_some() {
            let remaining = connections.live.len();
            self.count.send_replace(remaining);
            debug!(connection = %id, remaining, "Connection removed from registry");
        }
        removed
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            shared: Arc::new(RegistryShared {
                connections: Mutex::new(Connections::default()),
                count,
            }),
        }
    }

    /// Track a connection.
    ///
    /// Returns `false` without tracking it if the registry is draining, or
    /// if the connection is not open or belongs to another registry.
    #[instrument(skip(self, pump), fields(connection = %pump.id()))]
    pub fn add(&self, pump: &ConnectionPump) -> bool {
        let mut connections = self.shared.connections.lock();
        if connections.draining {
            debug!("Refusing to track a connection while draining");
            return false;
        }
        if !pump.attach(Arc::downgrade(&self.shared)) {
            debug!("Refusing to track a connection that is not open");
            return false;
        }
        connections.live.insert(pump.id().clone(), pump.clone());
        let active = connections.live.len();
        self.shared.count.send_replace(active);
        debug!(active, "Connection added to registry");
        true
    }

    /// Refuse every later [`add`](Self::add). Connections already tracked
    /// are kept.
    pub fn begin_drain(&self) {
        self.shared.connections.lock().draining = true;
    }

    pub fn is_draining(&self) -> bool {
        self.shared.connections.lock().draining
    }

    /// Stop tracking a connection. A no-op for unknown ids.
    pub fn remove(&self, id: &ConnectionId) -> Option<ConnectionPump> {
        self.shared.detach(id)
    }

    pub fn size(&self) -> usize {
        self.shared.connections.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn get(&self, id: &ConnectionId) -> Option<ConnectionPump> {
        self.shared.connections.lock().live.get(id).cloned()
    }

    /// All currently tracked connections.
    pub fn snapshot(&self) -> Vec<ConnectionPump> {
        self.shared.connections.lock().live.values().cloned().collect()
    }

    /// Wait until the registry is empty or `deadline` passes.
    ///
    /// Returns `true` if the registry was observed empty.
    pub async fn wait_empty(&self, deadline: Instant) -> bool {
        let mut count = self.shared.count.subscribe();
        tokio::time::timeout_at(deadline, count.wait_for(|n| *n == 0))
            .await
            .map(|seen| seen.is_ok())
            .unwrap_or(false)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
