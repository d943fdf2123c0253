use std::sync::Arc;

use anyhow::{Context, Result};
use billsync_core::JobStatus;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::controller::JobController;

/// Cron trigger that advances the RUNNING job by one batch per tick.
/// Returns `None` when the scheduler is disabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    controller: Arc<JobController>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let controller = controller.clone();
        Box::pin(async move { tick(&controller).await })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(%cron, "sync scheduler configured");
    Ok(Some(sched))
}

async fn tick(controller: &JobController) {
    let active = match controller.get_active().await {
        Ok(Some(job)) if job.status == JobStatus::Running => job,
        Ok(_) => {
            debug!("scheduler tick: no running sync job");
            return;
        }
        Err(err) => {
            warn!(error = %err, "scheduler tick: could not load active job");
            return;
        }
    };
    match controller.process(active.id).await {
        Ok(summary) => info!(
            job_id = %active.id,
            attempted = summary.attempted,
            status = %summary.job.status,
            "scheduled batch finished"
        ),
        Err(err) => warn!(job_id = %active.id, error = %err, "scheduled batch failed"),
    }
}
