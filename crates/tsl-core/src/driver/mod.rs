//! Owner loop for a [`SlotTable`].
//!
//! The table is not thread-safe and its [`SlotActions`](crate::SlotActions) callbacks must not
//! re-enter it. [`SlotTableDriver`] owns the table on a single task, applies the actions that
//! [`ChannelSlotActions`](crate::ChannelSlotActions) queues, and runs closures submitted through
//! any number of [`SlotTableHandle`]s in arrival order.
use std::future::IntoFuture;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    actions::SlotAction, error::DriverError, slot::TaskSlotPayload, table::SlotTable,
};

const COMMAND_QUEUE: usize = 64;
const FREE_CAUSE: &str = "last task left a releasing slot";
const TIMEOUT_CAUSE: &str = "slot was not claimed before its timeout";

type Command<T> = Box<dyn FnOnce(&mut SlotTable<T>) + Send>;

/// Cloneable access to a table owned by a [`SlotTableDriver`].
pub struct SlotTableHandle<T: TaskSlotPayload> {
    tx: mpsc::Sender<Command<T>>,
}

impl<T: TaskSlotPayload> Clone for SlotTableHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: TaskSlotPayload> SlotTableHandle<T> {
    /// Runs `f` against the table on the owner task and returns its result.
    pub async fn call<R, F>(&self, f: F) -> Result<R, DriverError>
    where
        F: FnOnce(&mut SlotTable<T>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command: Command<T> = Box::new(move |table| {
            let _ = reply_tx.send(f(table));
        });

        self.tx
            .send(command)
            .await
            .map_err(|_| DriverError::Stopped)?;
        reply_rx.await.map_err(|_| DriverError::Stopped)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct SlotTableDriver<T: TaskSlotPayload> {
    table: SlotTable<T>,
    actions: mpsc::UnboundedReceiver<SlotAction>,
    commands: mpsc::Receiver<Command<T>>,
}

impl<T: TaskSlotPayload> SlotTableDriver<T> {
    /// `actions` is the receiving end of the [`ChannelSlotActions`](crate::ChannelSlotActions)
    /// the table was started with.
    pub fn new(
        table: SlotTable<T>,
        actions: mpsc::UnboundedReceiver<SlotAction>,
    ) -> (Self, SlotTableHandle<T>) {
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let driver = Self {
            table,
            actions,
            commands,
        };
        (driver, SlotTableHandle { tx })
    }

    /// Serves actions and commands until `shutdown` fires, then closes the table.
    ///
    /// Keeps serving while the close is in flight so draining slots can still be finalized.
    /// Returns the closed table.
    pub async fn run(mut self, shutdown: CancellationToken) -> SlotTable<T> {
        debug!("slot table driver started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(action) = self.actions.recv() => self.on_action(action),
                Some(command) = self.commands.recv() => command(&mut self.table),
            }
        }

        info!("slot table driver shutting down");
        let mut closed = std::pin::pin!(self.table.close_async().into_future());
        loop {
            tokio::select! {
                biased;
                _ = &mut closed => break,
                Some(action) = self.actions.recv() => self.on_action(action),
                Some(command) = self.commands.recv() => command(&mut self.table),
            }
        }

        debug!("slot table driver stopped");
        self.table
    }

    fn on_action(&mut self, action: SlotAction) {
        match action {
            SlotAction::Free(allocation_id) => {
                if let Err(err) = self.table.free_slot(allocation_id, FREE_CAUSE) {
                    warn!(%allocation_id, error = %err, "failed to finalize releasing slot");
                }
            }
            SlotAction::Timeout {
                allocation_id,
                ticket,
            } => match self.table.is_valid_timeout(allocation_id, ticket) {
                Ok(true) => {
                    if let Err(err) = self.table.free_slot(allocation_id, TIMEOUT_CAUSE) {
                        warn!(%allocation_id, error = %err, "failed to free timed out slot");
                    }
                }
                Ok(false) => trace!(%allocation_id, %ticket, "ignoring stale slot timeout"),
                Err(err) => warn!(%allocation_id, error = %err, "cannot validate slot timeout"),
            },
        }
    }
}
