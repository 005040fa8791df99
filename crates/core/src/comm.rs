//! Communication groups for tensor parallelism
//!
//! Group formation is the only collective performed during conversion. Every
//! rank runs the same conversion sequence and calls
//! [`ParallelGroupManager::create_or_get_group`] with the same `tp_size`; the
//! transport blocks until all ranks have joined.
//!
//! ```text
//! rank 0 ──┐
//! rank 1 ──┼── new_group([0, tp_size)) ──> CommGroup ──> GroupRegistry
//! rank N ──┘                                   (reused by later calls)
//! ```
//!
//! Mismatched `tp_size` across ranks is not detected here; detecting it would
//! take another collective.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{CoreError, Result};
use crate::parallel::ParallelTopology;

/// Opaque handle to a formed communication group
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommGroup {
    id: u64,
    ranks: Vec<usize>,
}

impl CommGroup {
    pub fn new(id: u64, ranks: Vec<usize>) -> Self {
        Self { id, ranks }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }
}

/// Transport that can form communication groups
pub trait CollectiveTransport: Send + Sync {
    /// Form a group over `ranks`; blocks until every member has joined
    fn new_group(&self, ranks: &[usize]) -> Result<CommGroup>;
}

/// In-process transport for single-process execution
///
/// Every call forms a fresh group with a new id, which lets callers observe
/// whether a group was formed or reused.
#[derive(Debug, Default)]
pub struct LocalTransport {
    next_id: AtomicU64,
    formed: AtomicU64,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of groups formed so far
    pub fn groups_formed(&self) -> u64 {
        self.formed.load(Ordering::SeqCst)
    }
}

impl CollectiveTransport for LocalTransport {
    fn new_group(&self, ranks: &[usize]) -> Result<CommGroup> {
        if ranks.is_empty() {
            return Err(CoreError::CollectiveFailure("empty rank list".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.formed.fetch_add(1, Ordering::SeqCst);
        Ok(CommGroup::new(id, ranks.to_vec()))
    }
}

/// Process-wide published group
///
/// Created on first use of [`GroupRegistry::global`], lives until process
/// exit or an explicit [`GroupRegistry::reset`].
#[derive(Debug, Default)]
pub struct GroupRegistry {
    group: Mutex<Option<CommGroup>>,
}

static GLOBAL_REGISTRY: Lazy<Arc<GroupRegistry>> = Lazy::new(|| Arc::new(GroupRegistry::new()));

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every converter in this process
    pub fn global() -> Arc<GroupRegistry> {
        GLOBAL_REGISTRY.clone()
    }

    pub fn current(&self) -> Option<CommGroup> {
        self.group.lock().clone()
    }

    pub fn publish(&self, group: CommGroup) {
        *self.group.lock() = Some(group);
    }

    /// Drop the published group
    pub fn reset(&self) -> Option<CommGroup> {
        self.group.lock().take()
    }
}

/// Establishes or reuses the tensor-parallel group
pub struct ParallelGroupManager {
    transport: Arc<dyn CollectiveTransport>,
    registry: Arc<GroupRegistry>,
}

impl ParallelGroupManager {
    pub fn new(transport: Arc<dyn CollectiveTransport>, registry: Arc<GroupRegistry>) -> Self {
        Self {
            transport,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<GroupRegistry> {
        &self.registry
    }

    /// Build the topology for `tp_size` ranks as seen from `rank`
    pub fn create_or_get_group(&self, tp_size: usize, rank: usize) -> Result<ParallelTopology> {
        if tp_size < 2 {
            return ParallelTopology::new(1, 0, None);
        }

        // Hold the lock across formation so a group is formed at most once
        let mut published = self.registry.group.lock();
        let group = match published.as_ref() {
            Some(group) if group.size() == tp_size => {
                tracing::debug!(group = group.id(), "Reusing published tensor-parallel group");
                group.clone()
            }
            Some(group) => {
                return Err(CoreError::CollectiveFailure(format!(
                    "published group {} spans {} ranks, requested {}",
                    group.id(),
                    group.size(),
                    tp_size
                )));
            }
            None => {
                let ranks: Vec<usize> = (0..tp_size).collect();
                let group = self.transport.new_group(&ranks)?;
                tracing::info!(group = group.id(), tp_size, "Formed tensor-parallel group");
                *published = Some(group.clone());
                group
            }
        };

        ParallelTopology::new(tp_size, rank, Some(group))
    }
}
