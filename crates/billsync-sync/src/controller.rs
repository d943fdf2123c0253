use std::sync::Arc;

use billsync_core::{JobStatus, SyncJob, TypeRange};
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batch::{BatchProcessor, BatchSummary};
use crate::error::JobError;
use crate::store::{StoreError, SyncStore};

/// Owns the sync job lifecycle. At most one job is non-terminal at a time.
pub struct JobController {
    store: Arc<dyn SyncStore>,
    processor: BatchProcessor,
    plan: Vec<TypeRange>,
}

impl JobController {
    pub fn new(store: Arc<dyn SyncStore>, processor: BatchProcessor) -> Self {
        Self {
            store,
            processor,
            plan: Vec::new(),
        }
    }

    /// Plan handed to newly created jobs.
    pub fn with_plan(mut self, plan: Vec<TypeRange>) -> Self {
        self.plan = plan;
        self
    }

    pub fn plan(&self) -> &[TypeRange] {
        &self.plan
    }

    pub async fn create(&self) -> Result<SyncJob, JobError> {
        self.create_with_plan(self.plan.clone()).await
    }

    pub async fn create_with_plan(&self, plan: Vec<TypeRange>) -> Result<SyncJob, JobError> {
        if let Some(existing) = self.blocking_job().await? {
            return Err(JobError::Conflict {
                existing: existing.id,
                status: existing.status,
            });
        }

        let job = SyncJob::new_pending(plan, Utc::now());
        match self.store.insert_job(&job).await {
            Ok(()) => {}
            Err(StoreError::ActiveJobExists) => {
                let existing = self.blocking_job().await?;
                return Err(match existing {
                    Some(existing) => JobError::Conflict {
                        existing: existing.id,
                        status: existing.status,
                    },
                    None => StoreError::ActiveJobExists.into(),
                });
            }
            Err(err) => return Err(err.into()),
        }
        info!(job_id = %job.id, planned = job.planned_total(), "sync job created");
        Ok(job)
    }

    pub async fn start(&self, id: Uuid) -> Result<SyncJob, JobError> {
        self.transition(id, "start", &[JobStatus::Pending, JobStatus::Paused], JobStatus::Running)
            .await
    }

    pub async fn resume(&self, id: Uuid) -> Result<SyncJob, JobError> {
        self.transition(id, "resume", &[JobStatus::Paused, JobStatus::Pending], JobStatus::Running)
            .await
    }

    pub async fn pause(&self, id: Uuid) -> Result<SyncJob, JobError> {
        self.transition(id, "pause", &[JobStatus::Running], JobStatus::Paused)
            .await
    }

    /// Stop a non-terminal job. A batch in flight drops its current item
    /// and exits at the next checkpoint.
    pub async fn stop(&self, id: Uuid) -> Result<SyncJob, JobError> {
        self.transition(id, "stop", &JobStatus::NON_TERMINAL, JobStatus::Stopped)
            .await
    }

    pub async fn get(&self, id: Uuid) -> Result<SyncJob, JobError> {
        self.store.get_job(id).await?.ok_or(JobError::NotFound(id))
    }

    /// The RUNNING or PAUSED job, if any.
    pub async fn get_active(&self) -> Result<Option<SyncJob>, JobError> {
        let mut jobs = self
            .store
            .jobs_with_status(&[JobStatus::Running, JobStatus::Paused])
            .await?;
        if jobs.len() > 1 {
            warn!(count = jobs.len(), "more than one active sync job");
        }
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs.pop())
    }

    pub async fn process(&self, id: Uuid) -> Result<BatchSummary, JobError> {
        self.processor.process_batch(id).await
    }

    /// Run batches until the job leaves RUNNING.
    pub async fn run_until_idle(&self, id: Uuid) -> Result<SyncJob, JobError> {
        loop {
            let summary = self.process(id).await?;
            if summary.job.status != JobStatus::Running {
                return Ok(summary.job);
            }
        }
    }

    async fn blocking_job(&self) -> Result<Option<SyncJob>, StoreError> {
        let jobs = self.store.jobs_with_status(&JobStatus::NON_TERMINAL).await?;
        Ok(jobs.into_iter().min_by_key(|job| job.created_at))
    }

    async fn transition(
        &self,
        id: Uuid,
        action: &'static str,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<SyncJob, JobError> {
        // A concurrent writer can move the job between read and write; re-read once.
        for _ in 0..2 {
            let mut job = self.get(id).await?;
            let observed = job.status;
            if !from.contains(&observed) {
                return Err(JobError::InvalidTransition {
                    id,
                    action,
                    status: observed,
                });
            }

            let now = Utc::now();
            job.status = to;
            job.updated_at = now;
            if to == JobStatus::Running && job.started_at.is_none() {
                job.started_at = Some(now);
            }
            if to.is_terminal() {
                job.completed_at = Some(now);
            }

            if self.store.replace_job_if(&job, observed).await? {
                info!(job_id = %id, from = %observed, to = %to, "sync job transition");
                return Ok(job);
            }
            debug!(job_id = %id, action, "job status changed underneath; retrying");
        }

        let status = self.get(id).await?.status;
        Err(JobError::InvalidTransition { id, action, status })
    }
}
