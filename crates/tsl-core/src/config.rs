use serde::{Deserialize, Serialize};

use tsl_model::{MemorySize, ResourceProfile, TimeoutMs};

use crate::error::SlotTableError;

const MIN_PAGE_SIZE: usize = 4 * 1024;
const DEFAULT_PAGE_SIZE: usize = 32 * 1024;
const DEFAULT_RELEASE_GRACE_MS: TimeoutMs = 10_000;

/// Static configuration of a worker's slot table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TableConfig {
    /// Number of static slots; indices `0..number_slots` are always reported.
    pub number_slots: usize,
    /// Everything the worker may hand out to slots.
    pub total_resources: ResourceProfile,
    /// Profile of a static slot and of requests that do not name one.
    pub default_slot_profile: ResourceProfile,
    /// Page size of every slot's memory manager, in bytes.
    pub memory_page_size: usize,
    /// How long a closing slot waits for its managed memory to be released.
    pub memory_release_grace_ms: TimeoutMs,
}

impl TableConfig {
    /// Config with `number_slots` static slots sharing `total` evenly.
    pub fn evenly_divided(number_slots: usize, total: ResourceProfile) -> Self {
        let default_slot_profile = total.divide(number_slots.max(1) as u64);
        Self {
            number_slots,
            total_resources: total,
            default_slot_profile,
            ..Default::default()
        }
    }

    pub fn with_memory_page_size(mut self, page_size: usize) -> Self {
        self.memory_page_size = page_size;
        self
    }

    pub fn with_memory_release_grace_ms(mut self, grace: TimeoutMs) -> Self {
        self.memory_release_grace_ms = grace;
        self
    }

    pub fn validate(&self) -> Result<(), SlotTableError> {
        if self.number_slots == 0 {
            return Err(SlotTableError::InvalidConfig(
                "the number of task slots must be greater than 0".into(),
            ));
        }
        if self.memory_page_size < MIN_PAGE_SIZE || !self.memory_page_size.is_power_of_two() {
            return Err(SlotTableError::InvalidConfig(format!(
                "memory page size must be a power of two and at least {MIN_PAGE_SIZE}, got {}",
                self.memory_page_size
            )));
        }
        if !self.default_slot_profile.fits_within(&self.total_resources) {
            return Err(SlotTableError::InvalidConfig(format!(
                "default slot profile {} exceeds total resources {}",
                self.default_slot_profile, self.total_resources
            )));
        }
        Ok(())
    }
}

impl Default for TableConfig {
    fn default() -> Self {
        let slot = ResourceProfile::new()
            .with_cpu_millis(1000)
            .with_task_heap(MemorySize::from_mebibytes(128))
            .with_managed_memory(MemorySize::from_mebibytes(128))
            .with_network_memory(MemorySize::from_mebibytes(64));
        Self {
            number_slots: 1,
            total_resources: slot.clone(),
            default_slot_profile: slot,
            memory_page_size: DEFAULT_PAGE_SIZE,
            memory_release_grace_ms: DEFAULT_RELEASE_GRACE_MS,
        }
    }
}
