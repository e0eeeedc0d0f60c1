//! The per-worker slot table.
//!
//! [`SlotTable`] owns every live [`TaskSlot`] of a worker and keeps four indices consistent:
//! index -> allocation, allocation -> slot, job -> allocations and task -> allocation.
//! All mutation goes through `&mut self` on the owner context; there is no internal locking.
//! Query iterators take a snapshot of the relevant keys when called and resolve slots lazily,
//! so each call is a point-in-time view rather than a live one.
mod state;
pub use state::TableState;
use state::SharedState;

#[cfg(test)]
mod tests;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use tokio::runtime::Handle;
use tracing::{debug, info, instrument, trace};

use tsl_model::{
    AllocationId, ExecutionAttemptId, JobId, ResourceId, ResourceProfile, SlotId, SlotIndex,
    SlotIndexRequest, SlotReport, SlotStatus, TaskSlotState,
};

use crate::{
    actions::SlotActions,
    budget::ResourceBudget,
    completion::{CloseFuture, Completion},
    config::TableConfig,
    error::SlotTableError,
    memory::MemoryManager,
    slot::{TaskSlot, TaskSlotPayload},
    timer::{Ticket, TimeoutListener, TimerService},
};

const CLOSE_CAUSE: &str = "closing task slot table";

/// How far a [`SlotTable::free_slot`] call got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    /// Removed from every index and its resources returned to the budget.
    Released,
    /// Tasks are still bound: the slot is RELEASING and stays indexed until the last one leaves.
    Draining,
}

/// Result of freeing a slot.
///
/// `outcome` tells whether the slot left the table, `closed` whether its teardown finished.
#[derive(Debug, Clone)]
pub struct FreedSlot {
    pub index: SlotIndex,
    pub outcome: FreeOutcome,
    pub closed: CloseFuture,
}

impl FreedSlot {
    #[inline]
    pub fn is_released(&self) -> bool {
        self.outcome == FreeOutcome::Released
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.is_done()
    }
}

/// Forwards timer expiry to the owner's [`SlotActions`] while the table is started.
struct TimeoutForwarder {
    state: SharedState,
    actions: Arc<dyn SlotActions>,
}

impl TimeoutListener<AllocationId> for TimeoutForwarder {
    fn notify_timeout(&self, allocation_id: AllocationId, ticket: Ticket) {
        if self.state.get().is_started() {
            self.actions.timeout_slot(allocation_id, ticket);
        }
    }
}

pub struct SlotTable<T: TaskSlotPayload> {
    /// Static slot count; requested static indices live in `0..number_slots`.
    number_slots: usize,
    default_slot_profile: ResourceProfile,
    memory_page_size: usize,
    memory_release_grace: Duration,

    timer_service: TimerService<AllocationId>,
    budget: ResourceBudget,

    /// Index -> allocation currently holding it.
    slot_indices: BTreeMap<SlotIndex, AllocationId>,
    /// Allocation -> slot. Owns every live slot.
    allocated_slots: HashMap<AllocationId, TaskSlot<T>>,
    /// Execution attempt -> allocation of the slot it is bound to.
    task_slot_mappings: HashMap<ExecutionAttemptId, AllocationId>,
    slots_per_job: HashMap<JobId, HashSet<AllocationId>>,

    actions: Option<Arc<dyn SlotActions>>,
    executor: Option<Handle>,
    state: SharedState,
    /// Next dynamic index; never below `number_slots`.
    dynamic_slot_index: SlotIndex,
    closing: Completion,
}

impl<T: TaskSlotPayload> SlotTable<T> {
    pub fn new(
        config: &TableConfig,
        timer_service: TimerService<AllocationId>,
    ) -> Result<Self, SlotTableError> {
        config.validate()?;
        Ok(Self {
            number_slots: config.number_slots,
            default_slot_profile: config.default_slot_profile.clone(),
            memory_page_size: config.memory_page_size,
            memory_release_grace: Duration::from_millis(config.memory_release_grace_ms),
            timer_service,
            budget: ResourceBudget::new(config.total_resources.clone()),
            slot_indices: BTreeMap::new(),
            allocated_slots: HashMap::with_capacity(config.number_slots),
            task_slot_mappings: HashMap::with_capacity(4 * config.number_slots),
            slots_per_job: HashMap::with_capacity(4),
            actions: None,
            executor: None,
            state: SharedState::new(),
            dynamic_slot_index: config.number_slots,
            closing: Completion::new(),
        })
    }

    /// Binds the owner's callbacks and the runtime used for timers and background teardown.
    pub fn start(
        &mut self,
        actions: Arc<dyn SlotActions>,
        executor: Handle,
    ) -> Result<(), SlotTableError> {
        if self.state.get() != TableState::Created {
            return Err(SlotTableError::IllegalState(
                "the task slot table has to be just created before starting".into(),
            ));
        }

        let forwarder = Arc::new(TimeoutForwarder {
            state: self.state.clone(),
            actions: Arc::clone(&actions),
        });
        self.timer_service.start(forwarder, executor.clone())?;

        self.actions = Some(actions);
        self.executor = Some(executor);
        self.state.set(TableState::Running);
        info!(number_slots = self.number_slots, total = %self.budget.total_budget(), "task slot table started");
        Ok(())
    }

    /// Frees every live slot and completes once all of them are closed.
    ///
    /// Repeated calls return the same future.
    pub fn close_async(&mut self) -> CloseFuture {
        match self.state.get() {
            TableState::Created => {
                self.state.set(TableState::Closed);
                self.closing.complete();
            }
            TableState::Running => {
                self.state.set(TableState::Closing);
                info!(live = self.allocated_slots.len(), "closing task slot table");

                let allocation_ids: Vec<AllocationId> =
                    self.allocated_slots.keys().copied().collect();
                let pending: Vec<CloseFuture> = allocation_ids
                    .into_iter()
                    .filter_map(|allocation_id| self.free_slot_internal(allocation_id, CLOSE_CAUSE))
                    .map(|freed| freed.closed)
                    .collect();

                let Some(executor) = self.executor.as_ref() else {
                    unreachable!("a running task slot table always has an executor");
                };
                let state = self.state.clone();
                let timers = self.timer_service.shutdown_token();
                let closing = self.closing.clone();
                executor.spawn(async move {
                    CloseFuture::all(pending).await;
                    state.set(TableState::Closed);
                    timers.cancel();
                    closing.complete();
                    info!("task slot table closed");
                });
            }
            TableState::Closing | TableState::Closed => {}
        }
        self.closing.future()
    }

    #[inline]
    pub fn state(&self) -> TableState {
        self.state.get()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state.get() == TableState::Closed
    }

    #[inline]
    pub fn number_of_slots(&self) -> usize {
        self.number_slots
    }

    pub fn budget(&self) -> &ResourceBudget {
        &self.budget
    }

    // ---------------------------------------------------------------------
    // Slot methods
    // ---------------------------------------------------------------------

    /// Allocates a slot for `allocation_id` and returns its index.
    ///
    /// `profile = None` requests the default slot profile. Retrying an allocation that already
    /// exists with the same job, profile and index is a no-op returning the existing index.
    #[instrument(level = "debug", skip_all, fields(%job_id, %allocation_id, %requested))]
    pub fn allocate_slot(
        &mut self,
        requested: SlotIndexRequest,
        job_id: JobId,
        allocation_id: AllocationId,
        profile: Option<ResourceProfile>,
        timeout: Duration,
    ) -> Result<SlotIndex, SlotTableError> {
        self.check_running()?;
        let executor = self.executor()?.clone();

        let index = match requested {
            SlotIndexRequest::Dynamic => self.dynamic_slot_index,
            SlotIndexRequest::Fixed(index) => index,
        };
        let effective = profile.unwrap_or_else(|| self.default_slot_profile.clone());

        if let Some(existing) = self.allocated_slots.get(&allocation_id) {
            if self.is_duplicated_slot(existing, &job_id, &effective, requested) {
                info!(
                    index = existing.index(),
                    profile = %existing.resource_profile(),
                    "slot already exists for this allocation; no further allocation necessary"
                );
                return Ok(existing.index());
            }
            return Err(SlotTableError::AllocationConflict(format!(
                "a slot with allocation id {} and resource profile {} is already assigned to job {} with index {}",
                existing.allocation_id(),
                existing.resource_profile(),
                existing.job_id(),
                existing.index()
            )));
        }

        if let Some(owner) = self.slot_indices.get(&index) {
            return Err(SlotTableError::AllocationConflict(format!(
                "the slot with index {index} is already assigned to another allocation with id {owner}"
            )));
        }

        let next_dynamic_index = if self.is_dynamic_index(index) {
            if index < self.dynamic_slot_index && requested != SlotIndexRequest::Dynamic {
                return Err(SlotTableError::AllocationConflict(format!(
                    "dynamic slot index {index} was already handed out and cannot be reused"
                )));
            }
            index.checked_add(1).ok_or_else(|| {
                SlotTableError::AllocationConflict(format!(
                    "slot index {index} leaves no room for further dynamic slots"
                ))
            })?
        } else {
            self.dynamic_slot_index
        };

        if !self.budget.reserve(&effective) {
            return Err(SlotTableError::ResourceExhausted {
                available: self.budget.available_budget(),
                total: self.budget.total_budget().clone(),
                requested: effective,
            });
        }

        if let Err(err) = self.timer_service.register_timeout(allocation_id, timeout) {
            self.budget.release(&effective);
            return Err(err.into());
        }

        info!(index, resources = %effective, "allocated slot");
        let slot = TaskSlot::new(
            index,
            effective,
            self.memory_page_size,
            job_id,
            allocation_id,
            executor,
            self.memory_release_grace,
        );
        self.slot_indices.insert(index, allocation_id);
        self.allocated_slots.insert(allocation_id, slot);
        self.slots_per_job
            .entry(job_id)
            .or_default()
            .insert(allocation_id);

        self.dynamic_slot_index = next_dynamic_index;
        Ok(index)
    }

    /// Marks the slot active and cancels its expiry timeout.
    ///
    /// `Ok(false)` if the slot already was active.
    pub fn mark_slot_active(&mut self, allocation_id: AllocationId) -> Result<bool, SlotTableError> {
        self.check_running()?;
        if !self.allocated_slots.contains_key(&allocation_id) {
            return Err(SlotTableError::AllocationNotFound(allocation_id));
        }
        Ok(self.mark_existing_slot_active(allocation_id))
    }

    /// Activates the slot only if it is allocated for exactly this job and allocation.
    pub fn try_mark_slot_active(&mut self, job_id: JobId, allocation_id: AllocationId) -> bool {
        match self.allocated_slots.get(&allocation_id) {
            Some(slot) if slot.is_allocated(&job_id, &allocation_id) => {
                self.mark_existing_slot_active(allocation_id)
            }
            _ => false,
        }
    }

    /// Marks the slot inactive and makes it subject to expiry again after `timeout`.
    pub fn mark_slot_inactive(
        &mut self,
        allocation_id: AllocationId,
        timeout: Duration,
    ) -> Result<bool, SlotTableError> {
        self.check_started()?;
        let slot = self
            .allocated_slots
            .get_mut(&allocation_id)
            .ok_or(SlotTableError::AllocationNotFound(allocation_id))?;

        if !slot.mark_inactive() {
            return Ok(false);
        }
        debug!(%allocation_id, "deactivated slot");
        self.timer_service.register_timeout(allocation_id, timeout)?;
        Ok(true)
    }

    /// Frees the slot of `allocation_id`.
    ///
    /// An empty slot leaves every index at once; a slot with bound tasks turns RELEASING and
    /// is finalized through [`SlotActions::free_slot`] after its last task is removed.
    pub fn free_slot(
        &mut self,
        allocation_id: AllocationId,
        cause: &str,
    ) -> Result<FreedSlot, SlotTableError> {
        self.check_started()?;
        self.free_slot_internal(allocation_id, cause)
            .ok_or(SlotTableError::AllocationNotFound(allocation_id))
    }

    /// `true` while the table runs and `ticket` is the current timeout of `allocation_id`.
    pub fn is_valid_timeout(
        &self,
        allocation_id: AllocationId,
        ticket: Ticket,
    ) -> Result<bool, SlotTableError> {
        self.check_started()?;
        Ok(self.state.get() == TableState::Running
            && self.timer_service.is_valid(&allocation_id, ticket))
    }

    pub fn is_allocated(&self, index: SlotIndex, job_id: JobId, allocation_id: AllocationId) -> bool {
        self.slot_at(index)
            .is_some_and(|slot| slot.is_allocated(&job_id, &allocation_id))
    }

    pub fn is_slot_free(&self, index: SlotIndex) -> bool {
        !self.slot_indices.contains_key(&index)
    }

    pub fn current_allocation(&self, index: SlotIndex) -> Option<AllocationId> {
        self.slot_indices.get(&index).copied()
    }

    pub fn owning_job(&self, allocation_id: AllocationId) -> Option<JobId> {
        self.allocated_slots
            .get(&allocation_id)
            .map(|slot| slot.job_id())
    }

    pub fn slot(&self, allocation_id: AllocationId) -> Option<&TaskSlot<T>> {
        self.allocated_slots.get(&allocation_id)
    }

    /// Memory manager scoped to the slot of `allocation_id`.
    pub fn task_memory_manager(
        &self,
        allocation_id: AllocationId,
    ) -> Result<Arc<MemoryManager>, SlotTableError> {
        self.allocated_slots
            .get(&allocation_id)
            .map(|slot| Arc::clone(slot.memory_manager()))
            .ok_or(SlotTableError::AllocationNotFound(allocation_id))
    }

    /// Allocation ids currently held by `job_id`, in any state.
    pub fn allocation_ids_for_job(&self, job_id: JobId) -> HashSet<AllocationId> {
        self.slots_per_job.get(&job_id).cloned().unwrap_or_default()
    }

    pub fn active_allocation_ids(&self) -> HashSet<AllocationId> {
        self.slots_in_state(None, TaskSlotState::Active)
            .map(|slot| slot.allocation_id())
            .collect()
    }

    pub fn active_allocation_ids_for_job(&self, job_id: JobId) -> HashSet<AllocationId> {
        self.slots_in_state(Some(job_id), TaskSlotState::Active)
            .map(|slot| slot.allocation_id())
            .collect()
    }

    /// Slots of `job_id` that are allocated but not yet active.
    pub fn allocated_slots(&self, job_id: JobId) -> impl Iterator<Item = &TaskSlot<T>> + '_ {
        self.slots_in_state(Some(job_id), TaskSlotState::Allocated)
    }

    pub fn has_allocated_slots(&self, job_id: JobId) -> bool {
        self.allocated_slots(job_id).next().is_some()
    }

    // ---------------------------------------------------------------------
    // Slot report
    // ---------------------------------------------------------------------

    /// Every static index in order (free ones with the default profile), then live dynamic slots.
    pub fn create_slot_report(&self, resource_id: &ResourceId) -> SlotReport {
        let mut statuses = Vec::with_capacity(self.number_slots + self.allocated_slots.len());

        for index in 0..self.number_slots {
            let slot_id = SlotId::new(resource_id.clone(), index);
            let status = match self.slot_at(index) {
                Some(slot) => Self::status_of(slot_id, slot),
                None => SlotStatus {
                    slot_id,
                    resource_profile: self.default_slot_profile.clone(),
                    job_id: None,
                    allocation_id: None,
                },
            };
            statuses.push(status);
        }

        statuses.extend(
            self.allocated_slots
                .values()
                .filter(|slot| self.is_dynamic_index(slot.index()))
                .map(|slot| Self::status_of(SlotId::new(resource_id.clone(), slot.index()), slot)),
        );

        SlotReport::new(statuses)
    }

    // ---------------------------------------------------------------------
    // Task methods
    // ---------------------------------------------------------------------

    /// Binds `task` to the active slot of its allocation.
    ///
    /// `Ok(false)` if a task with the same execution id is already bound there.
    pub fn add_task(&mut self, task: T) -> Result<bool, SlotTableError> {
        self.check_running()?;

        let job_id = task.job_id();
        let allocation_id = task.allocation_id();
        let execution_id = task.execution_id();

        let slot = self
            .allocated_slots
            .get_mut(&allocation_id)
            .ok_or(SlotTableError::AllocationNotFound(allocation_id))?;
        if !slot.is_active(&job_id, &allocation_id) {
            return Err(SlotTableError::SlotNotActive {
                job_id,
                allocation_id,
            });
        }

        if !slot.add(task) {
            debug!(%execution_id, %allocation_id, "task already bound to slot");
            return Ok(false);
        }
        self.task_slot_mappings.insert(execution_id, allocation_id);
        trace!(%execution_id, %allocation_id, "task bound to slot");
        Ok(true)
    }

    /// Unbinds the task; finalizes a releasing slot through the owner once it is empty.
    pub fn remove_task(
        &mut self,
        execution_id: ExecutionAttemptId,
    ) -> Result<Option<T>, SlotTableError> {
        self.check_started()?;

        let Some(allocation_id) = self.task_slot_mappings.remove(&execution_id) else {
            return Ok(None);
        };
        let Some(slot) = self.allocated_slots.get_mut(&allocation_id) else {
            panic!("task {execution_id} is mapped to allocation {allocation_id} without a slot; this indicates a programming bug");
        };
        let Some(task) = slot.remove(&execution_id) else {
            panic!("task {execution_id} is mapped to a slot that does not hold it; this indicates a programming bug");
        };

        if slot.is_releasing() && slot.is_empty() {
            debug!(%allocation_id, "last task left releasing slot");
            if let Some(actions) = &self.actions {
                actions.free_slot(allocation_id);
            }
        }
        Ok(Some(task))
    }

    pub fn get_task(&self, execution_id: ExecutionAttemptId) -> Option<&T> {
        let allocation_id = self.task_slot_mappings.get(&execution_id)?;
        self.allocated_slots
            .get(allocation_id)
            .and_then(|slot| slot.task(&execution_id))
    }

    /// Tasks of `job_id` bound to its active slots.
    pub fn tasks(&self, job_id: JobId) -> impl Iterator<Item = &T> + '_ {
        self.slots_in_state(Some(job_id), TaskSlotState::Active)
            .flat_map(|slot| slot.tasks())
    }

    // ---------------------------------------------------------------------
    // Timeouts
    // ---------------------------------------------------------------------

    /// Hands an expired timeout to the owner. The table does not decide what a timeout means.
    pub fn notify_timeout(
        &self,
        allocation_id: AllocationId,
        ticket: Ticket,
    ) -> Result<(), SlotTableError> {
        self.check_started()?;
        if let Some(actions) = &self.actions {
            actions.timeout_slot(allocation_id, ticket);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Internal methods
    // ---------------------------------------------------------------------

    fn free_slot_internal(&mut self, allocation_id: AllocationId, cause: &str) -> Option<FreedSlot> {
        let slot = self.allocated_slots.get_mut(&allocation_id)?;
        info!(%allocation_id, index = slot.index(), cause, "free slot");

        if !slot.is_empty() {
            let closed = slot.close_async(cause);
            return Some(FreedSlot {
                index: slot.index(),
                outcome: FreeOutcome::Draining,
                closed,
            });
        }

        let mut slot = self.allocated_slots.remove(&allocation_id)?;
        self.timer_service.unregister_timeout(&allocation_id);

        let job_id = slot.job_id();
        let Some(slots) = self.slots_per_job.get_mut(&job_id) else {
            panic!(
                "there are no more slots allocated for the job {job_id}; this indicates a programming bug"
            );
        };
        slots.remove(&allocation_id);
        if slots.is_empty() {
            self.slots_per_job.remove(&job_id);
        }

        self.slot_indices.remove(&slot.index());
        self.budget.release(slot.resource_profile());

        let closed = slot.close_async(cause);
        Some(FreedSlot {
            index: slot.index(),
            outcome: FreeOutcome::Released,
            closed,
        })
    }

    fn mark_existing_slot_active(&mut self, allocation_id: AllocationId) -> bool {
        let Some(slot) = self.allocated_slots.get_mut(&allocation_id) else {
            return false;
        };
        if !slot.mark_active() {
            return false;
        }
        info!(%allocation_id, "activate slot");
        self.timer_service.unregister_timeout(&allocation_id);
        true
    }

    fn is_duplicated_slot(
        &self,
        slot: &TaskSlot<T>,
        job_id: &JobId,
        profile: &ResourceProfile,
        requested: SlotIndexRequest,
    ) -> bool {
        let same_index = match requested {
            SlotIndexRequest::Dynamic => self.is_dynamic_index(slot.index()),
            SlotIndexRequest::Fixed(index) => slot.index() == index,
        };
        slot.job_id() == *job_id && slot.resource_profile() == profile && same_index
    }

    /// Snapshot of the matching allocation ids, resolved lazily against the live slots.
    fn slots_in_state(
        &self,
        job_id: Option<JobId>,
        state: TaskSlotState,
    ) -> impl Iterator<Item = &TaskSlot<T>> + '_ {
        let allocation_ids: Vec<AllocationId> = match job_id {
            Some(job_id) => self
                .slots_per_job
                .get(&job_id)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default(),
            None => self.slots_per_job.values().flatten().copied().collect(),
        };

        allocation_ids
            .into_iter()
            .filter_map(move |allocation_id| self.allocated_slots.get(&allocation_id))
            .filter(move |slot| slot.state() == state)
    }

    fn slot_at(&self, index: SlotIndex) -> Option<&TaskSlot<T>> {
        self.slot_indices
            .get(&index)
            .and_then(|allocation_id| self.allocated_slots.get(allocation_id))
    }

    fn status_of(slot_id: SlotId, slot: &TaskSlot<T>) -> SlotStatus {
        SlotStatus {
            slot_id,
            resource_profile: slot.resource_profile().clone(),
            job_id: Some(slot.job_id()),
            allocation_id: Some(slot.allocation_id()),
        }
    }

    #[inline]
    fn is_dynamic_index(&self, index: SlotIndex) -> bool {
        index >= self.number_slots
    }

    fn executor(&self) -> Result<&Handle, SlotTableError> {
        self.executor.as_ref().ok_or_else(|| {
            SlotTableError::IllegalState("the task slot table has no executor bound".into())
        })
    }

    fn check_running(&self) -> Result<(), SlotTableError> {
        if self.state.get() != TableState::Running {
            return Err(SlotTableError::IllegalState(format!(
                "the task slot table has to be running, but is {:?}",
                self.state.get()
            )));
        }
        Ok(())
    }

    fn check_started(&self) -> Result<(), SlotTableError> {
        if !self.state.get().is_started() {
            return Err(SlotTableError::IllegalState(
                "the task slot table has to be started (not created)".into(),
            ));
        }
        Ok(())
    }
}
