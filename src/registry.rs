//! The endpoint registry: a concurrent, process-wide map from connection
//! identifier to remote endpoint handle, with a rendezvous mechanism for
//! lookups that arrive before the matching add.
//!
//! Concurrency shape is grounded on `protocol::nfs::portmap::PortmapTable`
//! (a lock-protected `HashMap` reached from multiple async tasks), collapsed
//! to a single `Mutex` since both maps here are mutated together and lookups
//! and adds are expected to be cheap.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::primitive::{ConnectionId, EndpointHandle};

struct Inner {
    endpoints: HashMap<ConnectionId, EndpointHandle>,
    pending: HashMap<ConnectionId, oneshot::Sender<EndpointHandle>>,
}

/// The sole synchronization point between an inbound listener thread and
/// the engine.
#[derive(Default)]
pub struct EndpointRegistry {
    inner: Mutex<Inner>,
}

impl Default for Inner {
    fn default() -> Self {
        Self { endpoints: HashMap::new(), pending: HashMap::new() }
    }
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new mapping. Errors if an entry already exists for `id`;
    /// adds must never overwrite an existing handle. If a lookup is
    /// pending for this id, its continuation is invoked and removed.
    pub fn add(&self, id: ConnectionId, endpoint: EndpointHandle) -> Result<()> {
        let mut inner = self.inner.lock().expect("endpoint registry mutex poisoned");
        if inner.endpoints.contains_key(&id) {
            return Err(anyhow!("duplicate add for connection id {:?}", id));
        }
        inner.endpoints.insert(id.clone(), endpoint.clone());
        if let Some(tx) = inner.pending.remove(&id) {
            debug!("endpoint registry: resolving pending lookup for {:?}", id);
            let _ = tx.send(endpoint);
        }
        Ok(())
    }

    /// A direct, non-blocking lookup; does not register a continuation.
    pub fn lookup(&self, id: &ConnectionId) -> Option<EndpointHandle> {
        self.inner.lock().expect("endpoint registry mutex poisoned").endpoints.get(id).cloned()
    }

    /// Registers a continuation to be resolved by the next `add` for `id`,
    /// or immediately if `id` is already present. Errors if a pending
    /// request is already outstanding for `id`: only one pending
    /// continuation is allowed per identifier at a time.
    pub fn lookup_or_wait(&self, id: ConnectionId) -> Result<oneshot::Receiver<EndpointHandle>> {
        let mut inner = self.inner.lock().expect("endpoint registry mutex poisoned");
        if let Some(existing) = inner.endpoints.get(&id).cloned() {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(existing);
            return Ok(rx);
        }
        if inner.pending.contains_key(&id) {
            warn!("endpoint registry: duplicate pending lookup for {:?}", id);
            return Err(anyhow!("a pending lookup already exists for connection id {:?}", id));
        }
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(id, tx);
        Ok(rx)
    }

    /// Removes an entry, e.g. when the owning server listener is torn down.
    pub fn remove(&self, id: &ConnectionId) -> Option<EndpointHandle> {
        self.inner.lock().expect("endpoint registry mutex poisoned").endpoints.remove(id)
    }
}
