use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Deserializer, Serialize};

use crate::MemorySize;

/// Multi-dimensional resource quantity reserved by a slot.
///
/// Every dimension is compared independently: a profile fits into another one only when
/// it is smaller or equal in *all* dimensions. Extended resources (GPUs, FPGAs, licenses...)
/// are keyed by name; a missing entry counts as zero and zero entries are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceProfile {
    /// CPU in thousandths of a core.
    #[serde(default)]
    pub cpu_millis: u64,
    #[serde(default)]
    pub task_heap: MemorySize,
    #[serde(default)]
    pub task_off_heap: MemorySize,
    /// Memory handed to the slot's memory manager.
    #[serde(default)]
    pub managed_memory: MemorySize,
    #[serde(default)]
    pub network_memory: MemorySize,
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "non_zero_entries"
    )]
    extended: BTreeMap<String, u64>,
}

fn non_zero_entries<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, u64>, D::Error> {
    let mut entries = BTreeMap::<String, u64>::deserialize(deserializer)?;
    entries.retain(|_, amount| *amount > 0);
    Ok(entries)
}

impl ResourceProfile {
    pub const ZERO: ResourceProfile = ResourceProfile {
        cpu_millis: 0,
        task_heap: MemorySize::ZERO,
        task_off_heap: MemorySize::ZERO,
        managed_memory: MemorySize::ZERO,
        network_memory: MemorySize::ZERO,
        extended: BTreeMap::new(),
    };

    pub fn new() -> Self {
        Self::ZERO
    }

    pub fn with_cpu_millis(mut self, cpu_millis: u64) -> Self {
        self.cpu_millis = cpu_millis;
        self
    }

    pub fn with_task_heap(mut self, size: MemorySize) -> Self {
        self.task_heap = size;
        self
    }

    pub fn with_task_off_heap(mut self, size: MemorySize) -> Self {
        self.task_off_heap = size;
        self
    }

    pub fn with_managed_memory(mut self, size: MemorySize) -> Self {
        self.managed_memory = size;
        self
    }

    pub fn with_network_memory(mut self, size: MemorySize) -> Self {
        self.network_memory = size;
        self
    }

    pub fn with_extended(mut self, name: impl Into<String>, amount: u64) -> Self {
        let name = name.into();
        if amount == 0 {
            self.extended.remove(&name);
        } else {
            self.extended.insert(name, amount);
        }
        self
    }

    /// Amount of the named extended resource (zero when absent).
    pub fn extended(&self, name: &str) -> u64 {
        self.extended.get(name).copied().unwrap_or(0)
    }

    /// Non-zero extended resources by name.
    pub fn extended_resources(&self) -> impl Iterator<Item = (&str, u64)> {
        self.extended
            .iter()
            .map(|(name, amount)| (name.as_str(), *amount))
    }

    pub fn is_zero(&self) -> bool {
        self.cpu_millis == 0
            && self.task_heap.is_zero()
            && self.task_off_heap.is_zero()
            && self.managed_memory.is_zero()
            && self.network_memory.is_zero()
            && self.extended.is_empty()
    }

    /// Returns `true` if `self` is smaller or equal than `other` in every dimension.
    pub fn fits_within(&self, other: &ResourceProfile) -> bool {
        self.cpu_millis <= other.cpu_millis
            && self.task_heap <= other.task_heap
            && self.task_off_heap <= other.task_off_heap
            && self.managed_memory <= other.managed_memory
            && self.network_memory <= other.network_memory
            && self
                .extended
                .iter()
                .all(|(name, amount)| *amount <= other.extended(name))
    }

    /// Componentwise sum; `None` if any dimension overflows.
    pub fn checked_add(&self, other: &ResourceProfile) -> Option<ResourceProfile> {
        let mut extended = self.extended.clone();
        for (name, amount) in &other.extended {
            let slot = extended.entry(name.clone()).or_insert(0);
            *slot = slot.checked_add(*amount)?;
        }

        Some(ResourceProfile {
            cpu_millis: self.cpu_millis.checked_add(other.cpu_millis)?,
            task_heap: self.task_heap.checked_add(other.task_heap)?,
            task_off_heap: self.task_off_heap.checked_add(other.task_off_heap)?,
            managed_memory: self.managed_memory.checked_add(other.managed_memory)?,
            network_memory: self.network_memory.checked_add(other.network_memory)?,
            extended,
        })
    }

    /// Componentwise difference; `None` if `other` does not fit into `self`.
    pub fn checked_sub(&self, other: &ResourceProfile) -> Option<ResourceProfile> {
        if !other.fits_within(self) {
            return None;
        }
        Some(self.saturating_sub(other))
    }

    /// Splits the profile into `parts` equal shares, rounding every dimension down.
    ///
    /// Used to derive the default slot profile from the worker's total resources.
    pub fn divide(&self, parts: u64) -> ResourceProfile {
        let parts = parts.max(1);
        let extended = self
            .extended
            .iter()
            .map(|(name, amount)| (name.clone(), amount / parts))
            .filter(|(_, amount)| *amount > 0)
            .collect();

        ResourceProfile {
            cpu_millis: self.cpu_millis / parts,
            task_heap: MemorySize::from_bytes(self.task_heap.bytes() / parts),
            task_off_heap: MemorySize::from_bytes(self.task_off_heap.bytes() / parts),
            managed_memory: MemorySize::from_bytes(self.managed_memory.bytes() / parts),
            network_memory: MemorySize::from_bytes(self.network_memory.bytes() / parts),
            extended,
        }
    }

    /// Componentwise difference clamped at zero.
    pub fn saturating_sub(&self, other: &ResourceProfile) -> ResourceProfile {
        let extended = self
            .extended
            .iter()
            .map(|(name, amount)| (name.clone(), amount.saturating_sub(other.extended(name))))
            .filter(|(_, amount)| *amount > 0)
            .collect();

        ResourceProfile {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            task_heap: self.task_heap.saturating_sub(other.task_heap),
            task_off_heap: self.task_off_heap.saturating_sub(other.task_off_heap),
            managed_memory: self.managed_memory.saturating_sub(other.managed_memory),
            network_memory: self.network_memory.saturating_sub(other.network_memory),
            extended,
        }
    }
}

impl fmt::Display for ResourceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ResourceProfile{{cpuCores={}.{:03}, taskHeap={}, taskOffHeap={}, managedMemory={}, networkMemory={}",
            self.cpu_millis / 1000,
            self.cpu_millis % 1000,
            self.task_heap,
            self.task_off_heap,
            self.managed_memory,
            self.network_memory,
        )?;
        for (name, amount) in &self.extended {
            write!(f, ", {name}={amount}")?;
        }
        f.write_str("}")
    }
}
