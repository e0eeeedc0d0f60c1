use thiserror::Error;

use tsl_model::{AllocationId, JobId, MemorySize, ResourceProfile};

#[derive(Debug, Error)]
pub enum SlotTableError {
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("no slot allocated for allocation {0}")]
    AllocationNotFound(AllocationId),

    #[error("allocation conflict: {0}")]
    AllocationConflict(String),

    #[error(
        "cannot allocate the requested resources: trying to allocate {requested}, \
         while the currently remaining available resources are {available}, total is {total}"
    )]
    ResourceExhausted {
        requested: ResourceProfile,
        available: ResourceProfile,
        total: ResourceProfile,
    },

    #[error("slot for job {job_id} and allocation {allocation_id} is not active")]
    SlotNotActive {
        job_id: JobId,
        allocation_id: AllocationId,
    },

    #[error("invalid table config: {0}")]
    InvalidConfig(String),

    #[error("timer service error: {0}")]
    Timer(#[from] TimerError),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    #[error("timer service has not been started")]
    NotStarted,
    #[error("timer service has already been started")]
    AlreadyStarted,
    #[error("timer service has been stopped")]
    Stopped,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("memory manager has been shut down")]
    Shutdown,
    #[error("insufficient managed memory: requested {requested}, available {available}")]
    Insufficient {
        requested: MemorySize,
        available: MemorySize,
    },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    #[error("slot table driver has stopped")]
    Stopped,
}
