use std::fmt;

use serde::{Deserialize, Serialize};

use crate::SlotIndex;

/// Which index an allocation request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SlotIndexRequest {
    /// Let the table pick the next dynamic index.
    Dynamic,
    /// A specific index; usually one of the static slots.
    Fixed(SlotIndex),
}

impl From<SlotIndex> for SlotIndexRequest {
    fn from(index: SlotIndex) -> Self {
        SlotIndexRequest::Fixed(index)
    }
}

impl fmt::Display for SlotIndexRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotIndexRequest::Dynamic => f.write_str("dynamic"),
            SlotIndexRequest::Fixed(index) => write!(f, "{index}"),
        }
    }
}
