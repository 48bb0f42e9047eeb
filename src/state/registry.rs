//! Concurrent swap registry with per-swap locking

use crate::error::{SwapError, SwapResult};
use crate::swap::{Phase, SwapDescriptor, SwapId, SwapState, SwapStatus};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// One registered swap: immutable terms plus the local party's state
pub struct SwapEntry {
    descriptor: Arc<SwapDescriptor>,
    /// Short-lived lock for reads and transitions
    state: Mutex<SwapState>,
    /// Held for a whole state machine step; serialises ledger actions
    drive: Mutex<()>,
}

impl SwapEntry {
    fn new(descriptor: SwapDescriptor, state: SwapState) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            state: Mutex::new(state),
            drive: Mutex::new(()),
        }
    }

    pub fn id(&self) -> SwapId {
        self.descriptor.swap_id
    }

    pub fn descriptor(&self) -> &SwapDescriptor {
        &self.descriptor
    }

    pub async fn lock_state(&self) -> MutexGuard<'_, SwapState> {
        self.state.lock().await
    }

    pub async fn lock_drive(&self) -> MutexGuard<'_, ()> {
        self.drive.lock().await
    }

    pub async fn snapshot(&self) -> SwapState {
        self.state.lock().await.clone()
    }

    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase
    }

    pub async fn status(&self) -> SwapStatus {
        self.state.lock().await.status(&self.descriptor)
    }

    /// Terminal and untouched since `cutoff`; busy entries are never collectable
    fn is_collectable(&self, cutoff: chrono::DateTime<Utc>) -> bool {
        self.state
            .try_lock()
            .map(|s| s.phase.is_terminal() && s.updated_at <= cutoff)
            .unwrap_or(false)
    }
}

/// Registry of all swaps known to this actor
pub struct SwapRegistry {
    swaps: DashMap<SwapId, Arc<SwapEntry>>,
}

impl SwapRegistry {
    pub fn new() -> Self {
        Self {
            swaps: DashMap::new(),
        }
    }

    /// Register a swap unless one with the same id already exists
    ///
    /// Returns the entry and whether it was newly created. Registering the same
    /// id with different terms is a negotiation error.
    pub fn create_if_absent(
        &self,
        descriptor: SwapDescriptor,
        state: SwapState,
    ) -> SwapResult<(Arc<SwapEntry>, bool)> {
        match self.swaps.entry(descriptor.swap_id) {
            Entry::Occupied(existing) => {
                if existing.get().descriptor() != &descriptor {
                    return Err(SwapError::Negotiation(format!(
                        "swap {} is already registered with different terms",
                        descriptor.swap_id
                    )));
                }
                Ok((existing.get().clone(), false))
            }
            Entry::Vacant(slot) => {
                let swap_id = descriptor.swap_id;
                let entry = Arc::new(SwapEntry::new(descriptor, state));
                slot.insert(entry.clone());
                debug!(%swap_id, "Swap registered");
                Ok((entry, true))
            }
        }
    }

    pub fn get(&self, swap_id: &SwapId) -> SwapResult<Arc<SwapEntry>> {
        self.swaps
            .get(swap_id)
            .map(|e| e.clone())
            .ok_or(SwapError::SwapNotFound(*swap_id))
    }

    /// Remove swaps that have been terminal for at least `retention`
    pub fn remove_terminal(&self, retention: Duration) -> Vec<SwapId> {
        let retention = chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - retention;

        let candidates: Vec<SwapId> = self.swaps.iter().map(|e| *e.key()).collect();
        let mut removed = Vec::new();

        for swap_id in candidates {
            if self
                .swaps
                .remove_if(&swap_id, |_, entry| entry.is_collectable(cutoff))
                .is_some()
            {
                removed.push(swap_id);
            }
        }

        if !removed.is_empty() {
            info!("Removed {} terminal swaps from registry", removed.len());
        }
        removed
    }

    pub fn ids(&self) -> Vec<SwapId> {
        self.swaps.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.swaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.swaps.is_empty()
    }

    /// Status of every registered swap
    pub async fn statuses(&self) -> Vec<SwapStatus> {
        let entries: Vec<Arc<SwapEntry>> = self.swaps.iter().map(|e| e.value().clone()).collect();
        let mut statuses = Vec::with_capacity(entries.len());
        for entry in entries {
            statuses.push(entry.status().await);
        }
        statuses.sort_by_key(|s| s.created_at);
        statuses
    }

    /// Number of swaps not yet in a terminal phase
    pub async fn active_count(&self) -> usize {
        let entries: Vec<Arc<SwapEntry>> = self.swaps.iter().map(|e| e.value().clone()).collect();
        let mut active = 0;
        for entry in entries {
            if !entry.phase().await.is_terminal() {
                active += 1;
            }
        }
        active
    }
}

impl Default for SwapRegistry {
    fn default() -> Self {
        Self::new()
    }
}
