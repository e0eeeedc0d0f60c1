use tokio::sync::mpsc;
use tracing::trace;

use tsl_model::AllocationId;

use crate::timer::Ticket;

/// Callbacks from the slot table into the subsystem that owns it.
///
/// The table calls these while it is itself being mutated, so implementations must hand the
/// request back to the owner context instead of calling into the table directly.
pub trait SlotActions: Send + Sync {
    /// A slot that was asked to close has lost its last task and can be finalized.
    fn free_slot(&self, allocation_id: AllocationId);

    /// An allocated slot was not claimed in time.
    ///
    /// The owner validates `ticket` against the table before acting on it.
    fn timeout_slot(&self, allocation_id: AllocationId, ticket: Ticket);
}

/// A [`SlotActions`] call, as delivered by [`ChannelSlotActions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAction {
    Free(AllocationId),
    Timeout {
        allocation_id: AllocationId,
        ticket: Ticket,
    },
}

/// Forwards slot actions to the owner context over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSlotActions {
    tx: mpsc::UnboundedSender<SlotAction>,
}

impl ChannelSlotActions {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SlotAction>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, action: SlotAction) {
        if self.tx.send(action).is_err() {
            trace!(?action, "slot table owner is gone; dropping slot action");
        }
    }
}

impl SlotActions for ChannelSlotActions {
    fn free_slot(&self, allocation_id: AllocationId) {
        self.forward(SlotAction::Free(allocation_id));
    }

    fn timeout_slot(&self, allocation_id: AllocationId, ticket: Ticket) {
        self.forward(SlotAction::Timeout {
            allocation_id,
            ticket,
        });
    }
}
