use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use tokio::runtime::Handle;
use tracing::{debug, warn};

use tsl_model::{AllocationId, ExecutionAttemptId, JobId, ResourceProfile, SlotIndex, TaskSlotState};

use crate::{
    completion::{CloseFuture, Completion},
    memory::MemoryManager,
};

/// A task as far as slot bookkeeping is concerned.
pub trait TaskSlotPayload: Send + 'static {
    fn job_id(&self) -> JobId;
    fn execution_id(&self) -> ExecutionAttemptId;
    fn allocation_id(&self) -> AllocationId;

    /// Called when the slot hosting the task is being closed while the task is still bound.
    fn fail_externally(&self, _cause: &str) {}
}

/// A single slot: its reservation, bound tasks, state and scoped memory.
pub struct TaskSlot<T> {
    index: SlotIndex,
    resource_profile: ResourceProfile,
    job_id: JobId,
    allocation_id: AllocationId,
    state: TaskSlotState,
    tasks: HashMap<ExecutionAttemptId, T>,
    memory_manager: Arc<MemoryManager>,
    closing: Completion,
    teardown_started: bool,
    executor: Handle,
    release_grace: Duration,
}

impl<T: TaskSlotPayload> TaskSlot<T> {
    pub fn new(
        index: SlotIndex,
        resource_profile: ResourceProfile,
        memory_page_size: usize,
        job_id: JobId,
        allocation_id: AllocationId,
        executor: Handle,
        release_grace: Duration,
    ) -> Self {
        let memory_manager = Arc::new(MemoryManager::for_profile(
            &resource_profile,
            memory_page_size,
        ));
        Self {
            index,
            resource_profile,
            job_id,
            allocation_id,
            state: TaskSlotState::Allocated,
            tasks: HashMap::new(),
            memory_manager,
            closing: Completion::new(),
            teardown_started: false,
            executor,
            release_grace,
        }
    }

    #[inline]
    pub fn index(&self) -> SlotIndex {
        self.index
    }

    #[inline]
    pub fn resource_profile(&self) -> &ResourceProfile {
        &self.resource_profile
    }

    #[inline]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    #[inline]
    pub fn allocation_id(&self) -> AllocationId {
        self.allocation_id
    }

    #[inline]
    pub fn state(&self) -> TaskSlotState {
        self.state
    }

    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory_manager
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    #[inline]
    pub fn is_releasing(&self) -> bool {
        self.state == TaskSlotState::Releasing
    }

    pub fn is_active(&self, job_id: &JobId, allocation_id: &AllocationId) -> bool {
        self.state == TaskSlotState::Active && self.is_owned_by(job_id, allocation_id)
    }

    /// `true` if the slot belongs to the pair and is not being released.
    pub fn is_allocated(&self, job_id: &JobId, allocation_id: &AllocationId) -> bool {
        self.state != TaskSlotState::Releasing && self.is_owned_by(job_id, allocation_id)
    }

    /// ALLOCATED -> ACTIVE. `false` if the slot is not in ALLOCATED.
    pub fn mark_active(&mut self) -> bool {
        if self.state == TaskSlotState::Allocated {
            self.state = TaskSlotState::Active;
            true
        } else {
            false
        }
    }

    /// ACTIVE -> ALLOCATED. `false` if the slot is not in ACTIVE.
    pub fn mark_inactive(&mut self) -> bool {
        if self.state == TaskSlotState::Active {
            self.state = TaskSlotState::Allocated;
            true
        } else {
            false
        }
    }

    /// Binds `task`; `false` if a task with the same execution id is already bound.
    ///
    /// # Panics
    /// If the task belongs to another job or allocation, or the slot is not active.
    pub fn add(&mut self, task: T) -> bool {
        assert_eq!(task.job_id(), self.job_id, "task belongs to a different job");
        assert_eq!(
            task.allocation_id(),
            self.allocation_id,
            "task belongs to a different allocation"
        );
        assert_eq!(
            self.state,
            TaskSlotState::Active,
            "the task slot is not in state active"
        );

        let execution_id = task.execution_id();
        if self.tasks.contains_key(&execution_id) {
            return false;
        }
        self.tasks.insert(execution_id, task);
        true
    }

    pub fn remove(&mut self, execution_id: &ExecutionAttemptId) -> Option<T> {
        self.tasks.remove(execution_id)
    }

    pub fn task(&self, execution_id: &ExecutionAttemptId) -> Option<&T> {
        self.tasks.get(execution_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &T> {
        self.tasks.values()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Requests the slot to close.
    ///
    /// The first call moves the slot to RELEASING and fails every bound task. Memory is torn
    /// down once the slot is empty: synchronously if nothing holds managed memory, otherwise on
    /// the executor after waiting (up to the release grace) for outstanding users. Every call
    /// returns the same future; calling again after the last task left starts the teardown.
    pub fn close_async(&mut self, cause: &str) -> CloseFuture {
        if !self.is_releasing() {
            self.state = TaskSlotState::Releasing;
            for task in self.tasks.values() {
                task.fail_externally(cause);
            }
        }

        if self.tasks.is_empty() && !self.teardown_started {
            self.teardown_started = true;
            self.teardown();
        }
        self.closing.future()
    }

    fn teardown(&self) {
        self.memory_manager.shutdown();
        if self.memory_manager.verify_empty() {
            self.closing.complete();
            return;
        }

        let memory = Arc::clone(&self.memory_manager);
        let closing = self.closing.clone();
        let grace = self.release_grace;
        let allocation_id = self.allocation_id;
        debug!(%allocation_id, used = %memory.used_memory(), "waiting for managed memory release");
        self.executor.spawn(async move {
            if tokio::time::timeout(grace, memory.released()).await.is_err() {
                warn!(
                    %allocation_id,
                    leaked = %memory.used_memory(),
                    "not all managed memory was released before the slot closed"
                );
            }
            closing.complete();
        });
    }

    fn is_owned_by(&self, job_id: &JobId, allocation_id: &AllocationId) -> bool {
        self.job_id == *job_id && self.allocation_id == *allocation_id
    }
}

impl<T> fmt::Display for TaskSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TaskSlot(index:{}, state:{}, resource profile: {}, allocationId: {}, jobId: {})",
            self.index, self.state, self.resource_profile, self.allocation_id, self.job_id
        )
    }
}

impl<T> fmt::Debug for TaskSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSlot")
            .field("index", &self.index)
            .field("state", &self.state)
            .field("job_id", &self.job_id)
            .field("allocation_id", &self.allocation_id)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}
