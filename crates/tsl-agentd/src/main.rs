mod config;
mod task;

use std::sync::Arc;

use anyhow::Context;
use tokio::{runtime::Handle, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tsl_core::{ChannelSlotActions, SlotTable, SlotTableDriver, SlotTableHandle, TimerService};
use tsl_model::{AllocationId, ExecutionAttemptId, JobId, ResourceId, SlotIndexRequest};
use tsl_observe::logger_init;

use crate::{config::AgentConfig, task::AgentTask};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AgentConfig::load()?;
    logger_init(&cfg.logger)?;

    let resource_id = resource_id();
    info!(%resource_id, slots = cfg.table.number_slots, total = %cfg.table.total_resources, "starting tsl-agentd");

    let mut table = SlotTable::<AgentTask>::new(&cfg.table, TimerService::new())?;
    let (actions, actions_rx) = ChannelSlotActions::new();
    table.start(Arc::new(actions), Handle::current())?;

    let (driver, handle) = SlotTableDriver::new(table, actions_rx);
    let shutdown = CancellationToken::new();
    let driver = tokio::spawn(driver.run(shutdown.clone()));

    let (failed_tx, failed_rx) = mpsc::unbounded_channel();
    tokio::spawn(unbind_failed_tasks(handle.clone(), failed_rx));

    if cfg.claim_static_slots {
        claim_static_slots(&handle, &cfg, failed_tx.clone()).await?;
    }
    drop(failed_tx);

    let mut ticker = tokio::time::interval(cfg.report_interval());
    loop {
        tokio::select! {
            _ = ticker.tick() => report(&handle, &resource_id).await?,
            res = tokio::signal::ctrl_c() => {
                res.context("waiting for ctrl-c")?;
                info!("shutdown requested");
                break;
            }
        }
    }

    shutdown.cancel();
    let table = driver.await.context("slot table driver panicked")?;
    info!(closed = table.is_closed(), "tsl-agentd stopped");
    Ok(())
}

/// Host name of the machine, or a random id when it cannot be read.
fn resource_id() -> ResourceId {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .map(ResourceId::from)
        .unwrap_or_else(ResourceId::generate)
}

/// Allocates every static slot to one local job, activates it and binds a placeholder task.
async fn claim_static_slots(
    handle: &SlotTableHandle<AgentTask>,
    cfg: &AgentConfig,
    failed: mpsc::UnboundedSender<ExecutionAttemptId>,
) -> anyhow::Result<()> {
    let job_id = JobId::new();
    let timeout = cfg.slot_timeout();

    for index in 0..cfg.table.number_slots {
        let allocation_id = AllocationId::new();
        let task = AgentTask::new(job_id, allocation_id, failed.clone());
        handle
            .call(move |table| {
                table.allocate_slot(
                    SlotIndexRequest::Fixed(index),
                    job_id,
                    allocation_id,
                    None,
                    timeout,
                )?;
                table.mark_slot_active(allocation_id)?;
                table.add_task(task)
            })
            .await??;
        debug!(index, %allocation_id, "claimed static slot");
    }
    info!(%job_id, slots = cfg.table.number_slots, "claimed static slots");
    Ok(())
}

/// Unbinds tasks whose slot is closing, so draining slots can be finalized.
async fn unbind_failed_tasks(
    handle: SlotTableHandle<AgentTask>,
    mut failed: mpsc::UnboundedReceiver<ExecutionAttemptId>,
) {
    while let Some(execution_id) = failed.recv().await {
        match handle.call(move |table| table.remove_task(execution_id)).await {
            Ok(Ok(_)) => debug!(%execution_id, "unbound failed task"),
            Ok(Err(err)) => warn!(%execution_id, error = %err, "cannot unbind task"),
            Err(_) => break,
        }
    }
}

async fn report(handle: &SlotTableHandle<AgentTask>, resource_id: &ResourceId) -> anyhow::Result<()> {
    let resource_id = resource_id.clone();
    let (report, available) = handle
        .call(move |table| {
            (
                table.create_slot_report(&resource_id),
                table.budget().available_budget(),
            )
        })
        .await?;

    let free = report.iter().filter(|status| status.is_free()).count();
    info!(slots = report.len(), free, %available, "slot report");
    debug!(report = %serde_json::to_string(&report)?, "slot report detail");
    Ok(())
}
