//! Scoped managed memory of a single slot.
//!
//! Every slot owns one [`MemoryManager`] sized from its profile's managed memory. Tasks running
//! in the slot reserve page-granular chunks under an owner key. This is the only piece of slot
//! state shared with the execution layer, hence the internal lock.
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use tokio::sync::Notify;
use tracing::{debug, trace};

use tsl_model::{MemorySize, ResourceProfile};

use crate::error::MemoryError;

pub struct MemoryManager {
    page_size: u64,
    total: MemorySize,
    inner: Mutex<MemoryState>,
    released: Notify,
}

#[derive(Default)]
struct MemoryState {
    used: u64,
    by_owner: HashMap<String, u64>,
    shutdown: bool,
}

impl MemoryManager {
    /// # Panics
    /// If `page_size` is zero.
    pub fn new(total: MemorySize, page_size: usize) -> Self {
        assert!(page_size > 0, "memory page size must be positive");
        Self {
            page_size: page_size as u64,
            total,
            inner: Mutex::new(MemoryState::default()),
            released: Notify::new(),
        }
    }

    pub fn for_profile(profile: &ResourceProfile, page_size: usize) -> Self {
        Self::new(profile.managed_memory, page_size)
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size as usize
    }

    #[inline]
    pub fn memory_size(&self) -> MemorySize {
        self.total
    }

    /// Reserves `bytes` (rounded up to whole pages) for `owner`.
    pub fn reserve_memory(&self, owner: &str, bytes: u64) -> Result<MemorySize, MemoryError> {
        let amount = self.round_up(bytes);
        let mut state = self.state();
        if state.shutdown {
            return Err(MemoryError::Shutdown);
        }

        let available = self.total.bytes().saturating_sub(state.used);
        if amount > available {
            return Err(MemoryError::Insufficient {
                requested: MemorySize::from_bytes(amount),
                available: MemorySize::from_bytes(available),
            });
        }

        state.used += amount;
        *state.by_owner.entry(owner.to_string()).or_insert(0) += amount;
        trace!(owner, reserved = amount, "managed memory reserved");
        Ok(MemorySize::from_bytes(amount))
    }

    /// Releases up to `bytes` (rounded up to whole pages) held by `owner`.
    ///
    /// Returns the amount actually released.
    pub fn release_memory(&self, owner: &str, bytes: u64) -> MemorySize {
        let amount = self.round_up(bytes);
        let mut state = self.state();
        let Some(held) = state.by_owner.get_mut(owner) else {
            return MemorySize::ZERO;
        };

        let freed = amount.min(*held);
        *held -= freed;
        if *held == 0 {
            state.by_owner.remove(owner);
        }
        self.account_release(&mut state, freed);
        MemorySize::from_bytes(freed)
    }

    /// Releases everything held by `owner`.
    pub fn release_all(&self, owner: &str) -> MemorySize {
        let mut state = self.state();
        let freed = state.by_owner.remove(owner).unwrap_or(0);
        self.account_release(&mut state, freed);
        MemorySize::from_bytes(freed)
    }

    pub fn available_memory(&self) -> MemorySize {
        let state = self.state();
        MemorySize::from_bytes(self.total.bytes().saturating_sub(state.used))
    }

    pub fn used_memory(&self) -> MemorySize {
        MemorySize::from_bytes(self.state().used)
    }

    /// Rejects further reservations. Memory already held stays held until released.
    pub fn shutdown(&self) {
        let mut state = self.state();
        if !state.shutdown {
            state.shutdown = true;
            debug!(used = state.used, "memory manager shut down");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.state().shutdown
    }

    /// `true` if no memory is reserved by anyone.
    pub fn verify_empty(&self) -> bool {
        self.state().used == 0
    }

    /// Resolves once no memory is reserved.
    pub async fn released(&self) {
        loop {
            let notified = self.released.notified();
            if self.verify_empty() {
                return;
            }
            notified.await;
        }
    }

    fn account_release(&self, state: &mut MemoryState, freed: u64) {
        state.used -= freed;
        if freed > 0 {
            trace!(released = freed, "managed memory released");
        }
        if state.used == 0 {
            self.released.notify_waiters();
        }
    }

    fn round_up(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.page_size).saturating_mul(self.page_size)
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("page_size", &self.page_size)
            .field("total", &self.total)
            .field("used", &self.state().used)
            .finish()
    }
}
