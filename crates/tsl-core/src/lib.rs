//! Per-worker slot bookkeeping.
//!
//! [`SlotTable`] partitions a worker's static and dynamic slots among jobs, enforces the
//! worker's [`ResourceBudget`], tracks slot and task state, and expires unclaimed allocations
//! through a [`TimerService`]. The table is owned by a single serialized context; see
//! [`driver`] for a ready-made owner loop.

pub mod error;
pub use error::{DriverError, MemoryError, SlotTableError, TimerError};

pub mod actions;
pub use actions::{ChannelSlotActions, SlotAction, SlotActions};

pub mod budget;
pub use budget::ResourceBudget;

mod completion;
pub use completion::CloseFuture;

pub mod config;
pub use config::TableConfig;

pub mod driver;
pub use driver::{SlotTableDriver, SlotTableHandle};

pub mod memory;
pub use memory::MemoryManager;

pub mod slot;
pub use slot::{TaskSlot, TaskSlotPayload};

pub mod table;
pub use table::{FreeOutcome, FreedSlot, SlotTable, TableState};

pub mod timer;
pub use timer::{Ticket, TimeoutListener, TimerService};
