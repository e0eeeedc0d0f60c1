use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

/// Lifecycle of a slot table. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TableState {
    Created = 0,
    Running = 1,
    Closing = 2,
    Closed = 3,
}

impl TableState {
    /// `true` once `start` was called (RUNNING, CLOSING or CLOSED).
    #[inline]
    pub fn is_started(&self) -> bool {
        *self != TableState::Created
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TableState::Created,
            1 => TableState::Running,
            2 => TableState::Closing,
            _ => TableState::Closed,
        }
    }
}

/// Table state shared with the timeout forwarder and the close task.
#[derive(Debug, Clone)]
pub(crate) struct SharedState(Arc<AtomicU8>);

impl SharedState {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicU8::new(TableState::Created as u8)))
    }

    #[inline]
    pub(crate) fn get(&self) -> TableState {
        TableState::from_u8(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set(&self, state: TableState) {
        self.0.store(state as u8, Ordering::Release);
    }
}
