//! Read side of the graph: snapshots, pulses and shared handles.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{broadcast, watch};

use super::{AgentLink, AgentNode};

/// A record shared between the store and its consumers.
///
/// The store mutates through the lock; consumers keep the `Arc` and observe
/// the same allocation across updates.
pub type Shared<T> = Arc<RwLock<T>>;

/// Read a shared record, recovering the data if a writer panicked.
pub fn read<T>(handle: &Shared<T>) -> RwLockReadGuard<'_, T> {
    handle.read().unwrap_or_else(PoisonError::into_inner)
}

/// Write a shared record, recovering the data if a writer panicked.
pub fn write<T>(handle: &Shared<T>) -> RwLockWriteGuard<'_, T> {
    handle.write().unwrap_or_else(PoisonError::into_inner)
}

/// One-shot signal that a new, non-duplicate interaction was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pulse {
    pub source_id: String,
    pub target_id: String,
    pub message: Option<String>,
}

/// Immutable view of the graph at one version.
///
/// Every publication allocates new collections, so a consumer can detect a
/// change with `Arc::ptr_eq` on `nodes`/`links`. The handles inside are the
/// long-lived records and keep their identity between versions.
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    pub version: u64,
    pub nodes: Arc<[Shared<AgentNode>]>,
    pub links: Arc<[Shared<AgentLink>]>,
}

impl Default for GraphSnapshot {
    fn default() -> Self {
        Self {
            version: 0,
            nodes: Arc::from(Vec::new()),
            links: Arc::from(Vec::new()),
        }
    }
}

impl GraphSnapshot {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Find a node handle by agent id.
    pub fn node(&self, id: &str) -> Option<Shared<AgentNode>> {
        self.nodes.iter().find(|n| read(n).id == id).cloned()
    }

    /// Find a link handle by ordered pair.
    pub fn link(&self, source_id: &str, target_id: &str) -> Option<Shared<AgentLink>> {
        self.links
            .iter()
            .find(|l| {
                let link = read(l);
                link.source_id == source_id && link.target_id == target_id
            })
            .cloned()
    }

    /// Copy out node values, in insertion order.
    pub fn node_values(&self) -> Vec<AgentNode> {
        self.nodes.iter().map(|n| read(n).clone()).collect()
    }

    /// Copy out link values, in insertion order.
    pub fn link_values(&self) -> Vec<AgentLink> {
        self.links.iter().map(|l| read(l).clone()).collect()
    }
}

/// Consumer-side access to a [`GraphStore`](super::GraphStore).
///
/// Cheap to clone. Holds no reference to the store itself, so it can move to
/// other tasks while the store stays with its owner.
#[derive(Debug, Clone)]
pub struct GraphReader {
    pub(super) snapshots: watch::Receiver<GraphSnapshot>,
    pub(super) pulses: broadcast::Sender<Pulse>,
}

impl GraphReader {
    /// The latest published snapshot.
    pub fn snapshot(&self) -> GraphSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Subscribe to snapshot publications.
    pub fn subscribe(&self) -> watch::Receiver<GraphSnapshot> {
        self.snapshots.clone()
    }

    /// Subscribe to pulses emitted after this call.
    pub fn pulses(&self) -> broadcast::Receiver<Pulse> {
        self.pulses.subscribe()
    }
}
