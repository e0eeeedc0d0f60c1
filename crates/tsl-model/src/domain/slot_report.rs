use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{AllocationId, JobId, ResourceId, ResourceProfile, SlotIndex};

/// Cluster-wide identity of a slot: the worker plus the index inside its table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotId {
    pub resource_id: ResourceId,
    pub index: SlotIndex,
}

impl SlotId {
    pub fn new(resource_id: ResourceId, index: SlotIndex) -> Self {
        Self { resource_id, index }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.resource_id, self.index)
    }
}

/// Point-in-time status of one slot.
///
/// `job_id` and `allocation_id` are both `None` for a free static slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotStatus {
    pub slot_id: SlotId,
    pub resource_profile: ResourceProfile,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation_id: Option<AllocationId>,
}

impl SlotStatus {
    #[inline]
    pub fn is_free(&self) -> bool {
        self.allocation_id.is_none()
    }
}

/// Slot statuses published with every worker heartbeat.
///
/// Static slots come first in index order, dynamic slots follow in no particular order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotReport {
    statuses: Vec<SlotStatus>,
}

impl SlotReport {
    pub fn new(statuses: Vec<SlotStatus>) -> Self {
        Self { statuses }
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SlotStatus> {
        self.statuses.iter()
    }

    pub fn as_slice(&self) -> &[SlotStatus] {
        &self.statuses
    }
}

impl<'a> IntoIterator for &'a SlotReport {
    type Item = &'a SlotStatus;
    type IntoIter = std::slice::Iter<'a, SlotStatus>;

    fn into_iter(self) -> Self::IntoIter {
        self.statuses.iter()
    }
}
