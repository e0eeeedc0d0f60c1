use super::*;
use crate::{
    actions::{ChannelSlotActions, SlotAction},
    slot::tests::TestTask,
};

use tokio::sync::mpsc::UnboundedReceiver;
use tsl_model::MemorySize;

const TIMEOUT: Duration = Duration::from_secs(30);

fn slot_profile() -> ResourceProfile {
    ResourceProfile::new()
        .with_cpu_millis(1000)
        .with_managed_memory(MemorySize::from_mebibytes(1))
}

fn times(profile: &ResourceProfile, n: u64) -> ResourceProfile {
    (0..n).fold(ResourceProfile::ZERO, |acc, _| {
        acc.checked_add(profile).expect("no overflow")
    })
}

fn config(number_slots: usize, total: ResourceProfile) -> TableConfig {
    TableConfig {
        number_slots,
        total_resources: total,
        default_slot_profile: slot_profile(),
        ..Default::default()
    }
}

fn created(number_slots: usize, total: ResourceProfile) -> SlotTable<TestTask> {
    SlotTable::new(&config(number_slots, total), TimerService::new()).expect("valid config")
}

fn running(
    number_slots: usize,
    total: ResourceProfile,
) -> (SlotTable<TestTask>, UnboundedReceiver<SlotAction>) {
    let mut table = created(number_slots, total);
    let (actions, rx) = ChannelSlotActions::new();
    table
        .start(Arc::new(actions), Handle::current())
        .expect("start table");
    (table, rx)
}

fn live_profile_sum(table: &SlotTable<TestTask>) -> ResourceProfile {
    table
        .allocated_slots
        .values()
        .fold(ResourceProfile::ZERO, |acc, slot| {
            acc.checked_add(slot.resource_profile()).expect("no overflow")
        })
}

fn allocate(
    table: &mut SlotTable<TestTask>,
    requested: SlotIndexRequest,
    job_id: JobId,
    allocation_id: AllocationId,
) -> Result<SlotIndex, SlotTableError> {
    table.allocate_slot(requested, job_id, allocation_id, None, TIMEOUT)
}

#[tokio::test]
async fn zero_static_slots_is_invalid() {
    let result = SlotTable::<TestTask>::new(&config(0, slot_profile()), TimerService::new());
    assert!(matches!(result, Err(SlotTableError::InvalidConfig(_))));
}

#[tokio::test]
async fn operations_before_start_fail() {
    let mut table = created(1, slot_profile());
    let alloc = AllocationId::new();

    assert!(matches!(
        allocate(&mut table, SlotIndexRequest::Fixed(0), JobId::new(), alloc),
        Err(SlotTableError::IllegalState(_))
    ));
    assert!(matches!(
        table.free_slot(alloc, "test"),
        Err(SlotTableError::IllegalState(_))
    ));
    assert!(matches!(
        table.remove_task(ExecutionAttemptId::new()),
        Err(SlotTableError::IllegalState(_))
    ));
    assert!(matches!(
        table.mark_slot_active(alloc),
        Err(SlotTableError::IllegalState(_))
    ));
}

#[tokio::test]
async fn start_twice_fails() {
    let (mut table, _rx) = running(1, slot_profile());
    let (actions, _) = ChannelSlotActions::new();
    assert!(matches!(
        table.start(Arc::new(actions), Handle::current()),
        Err(SlotTableError::IllegalState(_))
    ));
    assert_eq!(table.state(), TableState::Running);
}

#[tokio::test]
async fn reserved_budget_tracks_live_slots() {
    let (mut table, _rx) = running(4, times(&slot_profile(), 4));
    let job = JobId::new();
    let allocs: Vec<AllocationId> = (0..4).map(|_| AllocationId::new()).collect();

    for (index, alloc) in allocs.iter().enumerate() {
        allocate(&mut table, SlotIndexRequest::Fixed(index), job, *alloc).unwrap();
        assert_eq!(table.budget().reserved_budget(), &live_profile_sum(&table));
    }
    assert!(table.budget().available_budget().is_zero());

    for alloc in allocs.iter().step_by(2) {
        let freed = table.free_slot(*alloc, "test").unwrap();
        assert!(freed.is_released());
        assert_eq!(table.budget().reserved_budget(), &live_profile_sum(&table));
    }
    assert_eq!(table.budget().reserved_budget(), &times(&slot_profile(), 2));
}

#[tokio::test]
async fn duplicate_allocation_is_a_noop() {
    let (mut table, _rx) = running(2, times(&slot_profile(), 2));
    let (job, alloc) = (JobId::new(), AllocationId::new());

    assert_eq!(allocate(&mut table, SlotIndexRequest::Fixed(1), job, alloc).unwrap(), 1);
    assert_eq!(allocate(&mut table, SlotIndexRequest::Fixed(1), job, alloc).unwrap(), 1);

    assert_eq!(table.budget().reserved_budget(), &slot_profile());
    assert_eq!(table.allocation_ids_for_job(job).len(), 1);
}

#[tokio::test]
async fn duplicate_dynamic_allocation_keeps_its_index() {
    let (mut table, _rx) = running(1, times(&slot_profile(), 3));
    let (job, alloc) = (JobId::new(), AllocationId::new());

    assert_eq!(allocate(&mut table, SlotIndexRequest::Dynamic, job, alloc).unwrap(), 1);
    assert_eq!(allocate(&mut table, SlotIndexRequest::Dynamic, job, alloc).unwrap(), 1);
    assert_eq!(table.budget().reserved_budget(), &slot_profile());

    // the dynamic counter was not consumed by the retry
    let other = AllocationId::new();
    assert_eq!(allocate(&mut table, SlotIndexRequest::Dynamic, job, other).unwrap(), 2);
}

#[tokio::test]
async fn conflicting_allocations_are_rejected() {
    let (mut table, _rx) = running(2, times(&slot_profile(), 2));
    let (job, alloc) = (JobId::new(), AllocationId::new());
    allocate(&mut table, SlotIndexRequest::Fixed(0), job, alloc).unwrap();

    // same allocation, other job
    assert!(matches!(
        allocate(&mut table, SlotIndexRequest::Fixed(0), JobId::new(), alloc),
        Err(SlotTableError::AllocationConflict(_))
    ));
    // same allocation, other index
    assert!(matches!(
        allocate(&mut table, SlotIndexRequest::Fixed(1), job, alloc),
        Err(SlotTableError::AllocationConflict(_))
    ));
    // same allocation, other profile
    let bigger = slot_profile().with_cpu_millis(2000);
    assert!(matches!(
        table.allocate_slot(SlotIndexRequest::Fixed(0), job, alloc, Some(bigger), TIMEOUT),
        Err(SlotTableError::AllocationConflict(_))
    ));
    // same index, other allocation
    assert!(matches!(
        allocate(&mut table, SlotIndexRequest::Fixed(0), job, AllocationId::new()),
        Err(SlotTableError::AllocationConflict(_))
    ));

    assert_eq!(table.budget().reserved_budget(), &slot_profile());
}

#[tokio::test]
async fn dynamic_indices_are_never_reused() {
    let (mut table, _rx) = running(2, times(&slot_profile(), 3));
    let job = JobId::new();

    let mut seen = Vec::new();
    for _ in 0..5 {
        let alloc = AllocationId::new();
        seen.push(allocate(&mut table, SlotIndexRequest::Dynamic, job, alloc).unwrap());
        table.free_slot(alloc, "test").unwrap();
    }
    assert_eq!(seen, vec![2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn fixed_index_beyond_static_range_advances_dynamic_counter() {
    let (mut table, _rx) = running(1, times(&slot_profile(), 3));
    let job = JobId::new();

    assert_eq!(
        allocate(&mut table, SlotIndexRequest::Fixed(3), job, AllocationId::new()).unwrap(),
        3
    );
    assert_eq!(
        allocate(&mut table, SlotIndexRequest::Dynamic, job, AllocationId::new()).unwrap(),
        4
    );
}

#[tokio::test]
async fn fixed_request_cannot_reclaim_a_dynamic_index() {
    let (mut table, _rx) = running(1, times(&slot_profile(), 2));
    let job = JobId::new();

    let first = AllocationId::new();
    assert_eq!(allocate(&mut table, SlotIndexRequest::Dynamic, job, first).unwrap(), 1);
    table.free_slot(first, "test").unwrap();
    assert!(table.is_slot_free(1));

    let second = AllocationId::new();
    assert!(matches!(
        allocate(&mut table, SlotIndexRequest::Fixed(1), job, second),
        Err(SlotTableError::AllocationConflict(_))
    ));
    assert!(table.slot(second).is_none());
    assert!(table.budget().reserved_budget().is_zero());

    assert_eq!(allocate(&mut table, SlotIndexRequest::Dynamic, job, second).unwrap(), 2);
}

#[tokio::test]
async fn fixed_dynamic_index_retry_is_still_a_noop() {
    let (mut table, _rx) = running(1, times(&slot_profile(), 2));
    let (job, alloc) = (JobId::new(), AllocationId::new());

    assert_eq!(allocate(&mut table, SlotIndexRequest::Fixed(4), job, alloc).unwrap(), 4);
    assert_eq!(allocate(&mut table, SlotIndexRequest::Fixed(4), job, alloc).unwrap(), 4);
    assert_eq!(table.budget().reserved_budget(), &slot_profile());
}

#[tokio::test]
async fn last_representable_index_is_rejected_untouched() {
    let (mut table, _rx) = running(1, slot_profile());
    let (job, alloc) = (JobId::new(), AllocationId::new());

    assert!(matches!(
        allocate(&mut table, SlotIndexRequest::Fixed(usize::MAX), job, alloc),
        Err(SlotTableError::AllocationConflict(_))
    ));
    assert!(table.slot(alloc).is_none());
    assert!(table.is_slot_free(usize::MAX));
    assert!(table.allocation_ids_for_job(job).is_empty());
    assert!(table.budget().reserved_budget().is_zero());

    assert_eq!(allocate(&mut table, SlotIndexRequest::Dynamic, job, alloc).unwrap(), 1);
}

#[tokio::test]
async fn retry_with_equivalent_deserialized_profile_is_a_noop() {
    let (mut table, _rx) = running(1, slot_profile());
    let (job, alloc) = (JobId::new(), AllocationId::new());
    let requested: ResourceProfile = serde_json::from_str(
        r#"{ "cpuMillis": 1000, "managedMemory": "1m", "extended": { "gpu": 0 } }"#,
    )
    .unwrap();

    let index = table
        .allocate_slot(SlotIndexRequest::Fixed(0), job, alloc, Some(slot_profile()), TIMEOUT)
        .unwrap();
    let retried = table
        .allocate_slot(SlotIndexRequest::Fixed(0), job, alloc, Some(requested), TIMEOUT)
        .unwrap();

    assert_eq!(retried, index);
    assert_eq!(table.budget().reserved_budget(), &slot_profile());
}

#[tokio::test]
async fn exhausted_budget_then_free_then_dynamic() {
    let profile = slot_profile();
    let (mut table, _rx) = running(1, profile.clone());
    let job = JobId::new();
    let (a1, a2) = (AllocationId::new(), AllocationId::new());

    assert_eq!(
        table
            .allocate_slot(SlotIndexRequest::Fixed(0), job, a1, Some(profile.clone()), TIMEOUT)
            .unwrap(),
        0
    );

    match table.allocate_slot(SlotIndexRequest::Fixed(1), job, a2, Some(profile.clone()), TIMEOUT) {
        Err(SlotTableError::ResourceExhausted {
            requested,
            available,
            total,
        }) => {
            assert_eq!(requested, profile);
            assert!(available.is_zero());
            assert_eq!(total, profile);
        }
        other => panic!("expected ResourceExhausted, got {other:?}"),
    }
    assert!(table.is_slot_free(1));

    let freed = table.free_slot(a1, "test").unwrap();
    assert_eq!(freed.index, 0);
    assert!(freed.is_released());
    assert!(freed.is_closed());
    assert!(table.budget().reserved_budget().is_zero());

    assert_eq!(
        table
            .allocate_slot(SlotIndexRequest::Dynamic, job, a2, Some(profile), TIMEOUT)
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn mark_active_is_idempotent() {
    let (mut table, _rx) = running(1, slot_profile());
    let (job, alloc) = (JobId::new(), AllocationId::new());
    allocate(&mut table, SlotIndexRequest::Fixed(0), job, alloc).unwrap();

    assert!(table.mark_slot_active(alloc).unwrap());
    assert!(!table.mark_slot_active(alloc).unwrap());
    assert_eq!(table.active_allocation_ids(), HashSet::from([alloc]));

    assert!(matches!(
        table.mark_slot_active(AllocationId::new()),
        Err(SlotTableError::AllocationNotFound(_))
    ));
}

#[tokio::test]
async fn try_mark_active_requires_matching_owner() {
    let (mut table, _rx) = running(1, slot_profile());
    let (job, alloc) = (JobId::new(), AllocationId::new());
    allocate(&mut table, SlotIndexRequest::Fixed(0), job, alloc).unwrap();

    assert!(!table.try_mark_slot_active(JobId::new(), alloc));
    assert!(!table.try_mark_slot_active(job, AllocationId::new()));
    assert!(table.try_mark_slot_active(job, alloc));
    assert!(!table.try_mark_slot_active(job, alloc));
}

#[tokio::test(start_paused = true)]
async fn unclaimed_slot_times_out_once() {
    let (mut table, mut rx) = running(1, slot_profile());
    let (job, alloc) = (JobId::new(), AllocationId::new());
    table
        .allocate_slot(SlotIndexRequest::Fixed(0), job, alloc, None, Duration::from_millis(10))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    match rx.try_recv() {
        Ok(SlotAction::Timeout {
            allocation_id,
            ticket,
        }) => {
            assert_eq!(allocation_id, alloc);
            assert!(table.is_valid_timeout(alloc, ticket).unwrap());
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn activated_slot_never_times_out() {
    let (mut table, mut rx) = running(1, slot_profile());
    let (job, alloc) = (JobId::new(), AllocationId::new());
    table
        .allocate_slot(SlotIndexRequest::Fixed(0), job, alloc, None, Duration::from_millis(10))
        .unwrap();
    assert!(table.mark_slot_active(alloc).unwrap());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn deactivated_slot_is_subject_to_timeout_again() {
    let (mut table, mut rx) = running(1, slot_profile());
    let (job, alloc) = (JobId::new(), AllocationId::new());
    allocate(&mut table, SlotIndexRequest::Fixed(0), job, alloc).unwrap();
    table.mark_slot_active(alloc).unwrap();

    assert!(table.mark_slot_inactive(alloc, Duration::from_millis(10)).unwrap());
    assert!(!table.mark_slot_inactive(alloc, Duration::from_millis(10)).unwrap());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(
        rx.try_recv(),
        Ok(SlotAction::Timeout { allocation_id, .. }) if allocation_id == alloc
    ));
}

#[tokio::test(start_paused = true)]
async fn timeout_ticket_is_stale_after_free() {
    let (mut table, mut rx) = running(1, slot_profile());
    let (job, alloc) = (JobId::new(), AllocationId::new());
    table
        .allocate_slot(SlotIndexRequest::Fixed(0), job, alloc, None, Duration::from_millis(10))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let Ok(SlotAction::Timeout { ticket, .. }) = rx.try_recv() else {
        panic!("expected a timeout");
    };

    table.free_slot(alloc, "test").unwrap();
    assert!(!table.is_valid_timeout(alloc, ticket).unwrap());
}

#[tokio::test]
async fn add_task_requires_active_slot() {
    let (mut table, _rx) = running(1, slot_profile());
    let (job, alloc) = (JobId::new(), AllocationId::new());

    assert!(matches!(
        table.add_task(TestTask::new(job, alloc)),
        Err(SlotTableError::AllocationNotFound(_))
    ));

    allocate(&mut table, SlotIndexRequest::Fixed(0), job, alloc).unwrap();
    assert!(matches!(
        table.add_task(TestTask::new(job, alloc)),
        Err(SlotTableError::SlotNotActive { .. })
    ));

    table.mark_slot_active(alloc).unwrap();
    assert!(matches!(
        table.add_task(TestTask::new(JobId::new(), alloc)),
        Err(SlotTableError::SlotNotActive { .. })
    ));

    let task = TestTask::new(job, alloc);
    assert!(table.add_task(task.clone()).unwrap());
    assert!(!table.add_task(task.clone()).unwrap());
    assert_eq!(table.task_slot_mappings.len(), 1);
}

#[tokio::test]
async fn task_index_follows_slot_membership() {
    let (mut table, _rx) = running(2, times(&slot_profile(), 2));
    let job = JobId::new();
    let (a1, a2) = (AllocationId::new(), AllocationId::new());
    allocate(&mut table, SlotIndexRequest::Fixed(0), job, a1).unwrap();
    allocate(&mut table, SlotIndexRequest::Fixed(1), job, a2).unwrap();
    table.mark_slot_active(a1).unwrap();
    table.mark_slot_active(a2).unwrap();

    let t1 = TestTask::new(job, a1);
    let t2 = TestTask::new(job, a2);
    let t3 = TestTask::new(job, a2);
    for task in [&t1, &t2, &t3] {
        assert!(table.add_task(task.clone()).unwrap());
    }

    assert_eq!(table.tasks(job).count(), 3);
    assert_eq!(
        table.get_task(t2.execution_id).map(|t| t.allocation_id),
        Some(a2)
    );

    let removed = table.remove_task(t2.execution_id).unwrap().expect("bound task");
    assert_eq!(removed.execution_id, t2.execution_id);
    assert!(table.get_task(t2.execution_id).is_none());
    assert!(table.remove_task(t2.execution_id).unwrap().is_none());
    assert_eq!(table.tasks(job).count(), 2);

    // deactivated slots do not contribute tasks
    table.mark_slot_inactive(a1, TIMEOUT).unwrap();
    assert_eq!(table.tasks(job).count(), 1);
}

#[tokio::test]
async fn slot_with_task_drains_before_release() {
    let (mut table, mut rx) = running(1, slot_profile());
    let (job, alloc) = (JobId::new(), AllocationId::new());
    allocate(&mut table, SlotIndexRequest::Fixed(0), job, alloc).unwrap();
    table.mark_slot_active(alloc).unwrap();
    let task = TestTask::new(job, alloc);
    table.add_task(task.clone()).unwrap();

    let freed = table.free_slot(alloc, "job finished").unwrap();
    assert_eq!(freed.outcome, FreeOutcome::Draining);
    assert!(!freed.is_closed());
    assert_eq!(task.failures.load(std::sync::atomic::Ordering::SeqCst), 1);

    // still holds index and budget
    assert!(!table.is_slot_free(0));
    assert_eq!(table.budget().reserved_budget(), &slot_profile());
    assert!(table.slot(alloc).unwrap().is_releasing());
    assert!(!table.is_allocated(0, job, alloc));

    table.remove_task(task.execution_id).unwrap();
    assert_eq!(rx.try_recv().unwrap(), SlotAction::Free(alloc));

    let released = table.free_slot(alloc, "last task left").unwrap();
    assert!(released.is_released());
    assert!(released.is_closed());
    assert!(freed.is_closed());
    assert!(table.is_slot_free(0));
    assert!(table.budget().reserved_budget().is_zero());
    assert!(table.allocation_ids_for_job(job).is_empty());
}

#[tokio::test]
async fn slot_report_lists_static_then_dynamic() {
    let (mut table, _rx) = running(2, times(&slot_profile(), 3));
    let job = JobId::new();
    let (a1, a2) = (AllocationId::new(), AllocationId::new());
    allocate(&mut table, SlotIndexRequest::Fixed(1), job, a1).unwrap();
    allocate(&mut table, SlotIndexRequest::Dynamic, job, a2).unwrap();

    let resource_id = ResourceId::from("worker-1");
    let report = table.create_slot_report(&resource_id);
    let statuses = report.as_slice();
    assert_eq!(statuses.len(), 3);

    assert_eq!(statuses[0].slot_id, SlotId::new(resource_id.clone(), 0));
    assert!(statuses[0].is_free());
    assert_eq!(statuses[0].resource_profile, slot_profile());

    assert_eq!(statuses[1].slot_id.index, 1);
    assert_eq!(statuses[1].allocation_id, Some(a1));
    assert_eq!(statuses[1].job_id, Some(job));

    assert_eq!(statuses[2].slot_id.index, 2);
    assert_eq!(statuses[2].allocation_id, Some(a2));

    table.free_slot(a2, "test").unwrap();
    assert_eq!(table.create_slot_report(&resource_id).len(), 2);
}

#[tokio::test]
async fn job_queries() {
    let (mut table, _rx) = running(3, times(&slot_profile(), 3));
    let (job, other) = (JobId::new(), JobId::new());
    let (a1, a2, a3) = (AllocationId::new(), AllocationId::new(), AllocationId::new());
    allocate(&mut table, SlotIndexRequest::Fixed(0), job, a1).unwrap();
    allocate(&mut table, SlotIndexRequest::Fixed(1), job, a2).unwrap();
    allocate(&mut table, SlotIndexRequest::Fixed(2), other, a3).unwrap();
    table.mark_slot_active(a2).unwrap();

    assert_eq!(table.allocation_ids_for_job(job), HashSet::from([a1, a2]));
    assert_eq!(table.active_allocation_ids_for_job(job), HashSet::from([a2]));
    assert_eq!(table.active_allocation_ids(), HashSet::from([a2]));

    let allocated: Vec<AllocationId> = table
        .allocated_slots(job)
        .map(|slot| slot.allocation_id())
        .collect();
    assert_eq!(allocated, vec![a1]);
    assert!(table.has_allocated_slots(other));
    assert!(!table.has_allocated_slots(JobId::new()));

    assert_eq!(table.owning_job(a3), Some(other));
    assert_eq!(table.owning_job(AllocationId::new()), None);
    assert_eq!(table.current_allocation(1), Some(a2));
    assert_eq!(table.current_allocation(5), None);
    assert!(table.is_allocated(0, job, a1));
    assert!(!table.is_allocated(0, other, a1));

    let memory = table.task_memory_manager(a1).unwrap();
    assert_eq!(memory.memory_size(), MemorySize::from_mebibytes(1));
    assert!(matches!(
        table.task_memory_manager(AllocationId::new()),
        Err(SlotTableError::AllocationNotFound(_))
    ));
}

#[tokio::test]
async fn close_created_table_completes_immediately() {
    let mut table = created(1, slot_profile());
    let closed = table.close_async();
    assert!(closed.is_done());
    assert!(table.is_closed());
}

#[tokio::test]
async fn close_frees_every_slot() {
    let (mut table, _rx) = running(3, times(&slot_profile(), 3));
    let job = JobId::new();
    for index in 0..3 {
        allocate(&mut table, SlotIndexRequest::Fixed(index), job, AllocationId::new()).unwrap();
    }

    let closed = table.close_async();
    assert_eq!(table.state(), TableState::Closing);
    closed.clone().await;

    assert!(table.is_closed());
    assert!(table.allocated_slots.is_empty());
    assert!(table.budget().reserved_budget().is_zero());
    assert!(table.close_async().is_done());

    assert!(matches!(
        allocate(&mut table, SlotIndexRequest::Fixed(0), job, AllocationId::new()),
        Err(SlotTableError::IllegalState(_))
    ));
    assert!(matches!(
        table.add_task(TestTask::new(job, AllocationId::new())),
        Err(SlotTableError::IllegalState(_))
    ));
}

#[tokio::test]
async fn close_waits_for_bound_tasks() {
    let (mut table, mut rx) = running(1, slot_profile());
    let (job, alloc) = (JobId::new(), AllocationId::new());
    allocate(&mut table, SlotIndexRequest::Fixed(0), job, alloc).unwrap();
    table.mark_slot_active(alloc).unwrap();
    let task = TestTask::new(job, alloc);
    table.add_task(task.clone()).unwrap();

    let closed = table.close_async();
    tokio::task::yield_now().await;
    assert!(!closed.is_done());
    assert_eq!(table.state(), TableState::Closing);

    // removing tasks and finishing deferred frees still works while closing
    table.remove_task(task.execution_id).unwrap();
    assert_eq!(rx.try_recv().unwrap(), SlotAction::Free(alloc));
    assert!(table.free_slot(alloc, "drained").unwrap().is_released());

    closed.clone().await;
    assert!(table.is_closed());
}
