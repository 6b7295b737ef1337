//! Attached peers, in attach order.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;

use crate::ipc::PeerLink;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct Table {
    next_id: u64,
    peers: IndexMap<PeerId, Arc<dyn PeerLink>>,
}

pub struct PeerRegistry {
    prefix: String,
    table: Mutex<Table>,
}

impl PeerRegistry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            table: Mutex::new(Table {
                next_id: 0,
                peers: IndexMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn attach(&self, link: Arc<dyn PeerLink>) -> PeerId {
        let mut table = self.lock();
        let id = PeerId(format!("{}{}", self.prefix, table.next_id));
        table.next_id += 1;
        table.peers.insert(id.clone(), link);
        id
    }

    /// Idempotent; returns `true` only for the call that removed the peer.
    pub fn detach(&self, id: &PeerId) -> bool {
        self.lock().peers.shift_remove(id).is_some()
    }

    pub fn get(&self, id: &PeerId) -> Option<Arc<dyn PeerLink>> {
        self.lock().peers.get(id).cloned()
    }

    /// Snapshot of the peers attached right now.
    pub fn list(&self) -> Vec<(PeerId, Arc<dyn PeerLink>)> {
        self.lock()
            .peers
            .iter()
            .map(|(id, link)| (id.clone(), link.clone()))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.lock().peers.contains_key(id)
    }
}

impl fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("prefix", &self.prefix)
            .field("count", &self.count())
            .finish()
    }
}
