use tokio::sync::mpsc;
use tracing::warn;

use tsl_core::TaskSlotPayload;
use tsl_model::{AllocationId, ExecutionAttemptId, JobId};

/// Placeholder workload bound to a slot.
///
/// Has no execution of its own: when its slot closes it reports itself on `failed` so the
/// agent can unbind it, which is what lets a draining slot finish.
#[derive(Debug)]
pub struct AgentTask {
    job_id: JobId,
    allocation_id: AllocationId,
    execution_id: ExecutionAttemptId,
    failed: mpsc::UnboundedSender<ExecutionAttemptId>,
}

impl AgentTask {
    pub fn new(
        job_id: JobId,
        allocation_id: AllocationId,
        failed: mpsc::UnboundedSender<ExecutionAttemptId>,
    ) -> Self {
        Self {
            job_id,
            allocation_id,
            execution_id: ExecutionAttemptId::new(),
            failed,
        }
    }
}

impl TaskSlotPayload for AgentTask {
    fn job_id(&self) -> JobId {
        self.job_id
    }

    fn execution_id(&self) -> ExecutionAttemptId {
        self.execution_id
    }

    fn allocation_id(&self) -> AllocationId {
        self.allocation_id
    }

    fn fail_externally(&self, cause: &str) {
        warn!(execution_id = %self.execution_id, allocation_id = %self.allocation_id, cause, "failing task");
        let _ = self.failed.send(self.execution_id);
    }
}
