use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a live task slot.
///
/// A free index has no slot object at all, so there is no `Free` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskSlotState {
    /// Reserved for a job but not yet claimed by it; subject to timeout.
    Allocated,
    /// Claimed by the owning job; tasks may be bound.
    Active,
    /// Close requested while tasks were still bound.
    Releasing,
}

impl TaskSlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskSlotState::Allocated => "allocated",
            TaskSlotState::Active => "active",
            TaskSlotState::Releasing => "releasing",
        }
    }
}

impl fmt::Display for TaskSlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
