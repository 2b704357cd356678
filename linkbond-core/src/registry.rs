//! Link resolution.
//!
//! Members carry only a `LinkId`; the registry resolves ids to live link
//! handles under its own lock. This breaks the group ↔ link reference cycle:
//! a link that has been torn down simply stops resolving, and the group
//! wipes the member on its next send round.
//!
//! Lock order is fixed: a caller that needs both the registry lock and a
//! group lock must take the registry lock first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::link::{Link, LinkId};

/// Resolves link ids to live link handles.
pub trait LinkRegistry: Send + Sync {
    /// Look up a link by id. `None` means the link is gone.
    fn resolve(&self, id: LinkId) -> Option<Arc<dyn Link>>;
}

/// In-process registry backed by a locked map.
///
/// Suitable for embedding and for tests; a transport stack with its own
/// socket registry implements `LinkRegistry` directly instead.
#[derive(Default)]
pub struct MemoryRegistry {
    links: Mutex<HashMap<LinkId, Arc<dyn Link>>>,
}

impl MemoryRegistry {
    pub fn new() -> MemoryRegistry {
        MemoryRegistry::default()
    }

    pub fn register(&self, link: Arc<dyn Link>) {
        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        links.insert(link.id(), link);
    }

    pub fn unregister(&self, id: LinkId) {
        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        links.remove(&id);
    }
}

impl LinkRegistry for MemoryRegistry {
    fn resolve(&self, id: LinkId) -> Option<Arc<dyn Link>> {
        let links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        links.get(&id).cloned()
    }
}
