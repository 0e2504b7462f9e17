use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// What the server knows about one live client connection
#[derive(Debug)]
pub struct ConnInfo {
    id: u32,
    peer: String,
    connected_at: Instant,
    killed: AtomicBool,
}

impl ConnInfo {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Remote address, or the socket path for unix connections
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Ask the connection to terminate; it stops before its next command
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }
}

/// Process-wide `connection id -> ConnInfo` map.
///
/// Ids start at 1, wrap at `u32::MAX` and skip ids still in use.
#[derive(Debug, Default)]
pub struct ConnRegistry {
    last_id: AtomicU32,
    conns: RwLock<HashMap<u32, Arc<ConnInfo>>>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection; it is removed again when the handle drops
    pub fn register(self: &Arc<Self>, peer: impl Into<String>) -> ConnHandle {
        let mut conns = self.conns.write().unwrap_or_else(PoisonError::into_inner);
        let id = loop {
            let id = self
                .last_id
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            if id != 0 && !conns.contains_key(&id) {
                break id;
            }
        };
        let info = Arc::new(ConnInfo {
            id,
            peer: peer.into(),
            connected_at: Instant::now(),
            killed: AtomicBool::new(false),
        });
        conns.insert(id, Arc::clone(&info));
        tracing::trace!(connection_id = id, peer = %info.peer, "connection registered");
        ConnHandle {
            registry: Arc::clone(self),
            info,
        }
    }

    pub fn get(&self, id: u32) -> Option<Arc<ConnInfo>> {
        self.conns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Mark a connection as killed. Returns false for unknown ids.
    pub fn kill(&self, id: u32) -> bool {
        match self.get(id) {
            Some(info) => {
                info.kill();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.conns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn deregister(&self, id: u32) {
        self.conns
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        tracing::trace!(connection_id = id, "connection deregistered");
    }
}

/// Registration of one connection; dropping it removes the entry
#[derive(Debug)]
pub struct ConnHandle {
    registry: Arc<ConnRegistry>,
    info: Arc<ConnInfo>,
}

impl ConnHandle {
    pub fn id(&self) -> u32 {
        self.info.id
    }

    pub fn info(&self) -> &ConnInfo {
        &self.info
    }

    pub fn registry(&self) -> &ConnRegistry {
        &self.registry
    }
}

impl Drop for ConnHandle {
    fn drop(&mut self) {
        self.registry.deregister(self.info.id);
    }
}
