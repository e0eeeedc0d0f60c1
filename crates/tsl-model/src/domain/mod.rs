mod ids;
pub use ids::{AllocationId, ExecutionAttemptId, JobId, ResourceId};

mod memory_size;
pub use memory_size::{MemorySize, MemorySizeParseError};

mod resource_profile;
pub use resource_profile::ResourceProfile;

mod slot_state;
pub use slot_state::TaskSlotState;

mod slot_request;
pub use slot_request::SlotIndexRequest;

mod slot_report;
pub use slot_report::{SlotId, SlotReport, SlotStatus};

/// Position of a slot inside a worker's slot table.
///
/// Indices below the configured static slot count are fixed at configuration time,
/// everything above belongs to dynamically created slots.
pub type SlotIndex = usize;

/// Timeout value in milliseconds.
///
/// Used in configuration where an explicit time limit is required.
pub type TimeoutMs = u64;
