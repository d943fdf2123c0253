//! One resumable pass over a job's cursor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use billsync_adapters::{DocumentParser, RemoteSource, SourceError};
use billsync_core::{BillId, JobStatus, SyncJob};
use billsync_storage::ArtifactStore;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::JobError;
use crate::store::{Checkpoint, SyncStore};
use crate::upsert::{upsert, UpsertOutcome};
use crate::validate::validate;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub item_delay: Duration,
    pub time_budget: Option<Duration>,
    pub fetch_full_text: bool,
    pub archive_failures: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            item_delay: Duration::ZERO,
            time_budget: None,
            fetch_full_text: true,
            archive_failures: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Created,
    Updated,
    NotFound,
    FetchFailed,
    ParseFailed,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub bill_id: String,
    pub outcome: ItemOutcome,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    /// Job as stored after the pass.
    pub job: SyncJob,
    pub attempted: usize,
    pub created: usize,
    pub updated: usize,
    pub not_found: usize,
    pub errors: usize,
    pub failures: Vec<ItemFailure>,
    /// The pass ended before `batch_size` identifiers for a reason other than
    /// the plan running out.
    pub cut_short: bool,
}

impl BatchSummary {
    fn idle(job: SyncJob) -> Self {
        Self {
            job,
            attempted: 0,
            created: 0,
            updated: 0,
            not_found: 0,
            errors: 0,
            failures: Vec::new(),
            cut_short: false,
        }
    }
}

enum ItemResult {
    Stored(UpsertOutcome),
    NotFound,
    Failed(ItemOutcome, String),
}

pub struct BatchProcessor {
    store: Arc<dyn SyncStore>,
    source: Arc<dyn RemoteSource>,
    parser: DocumentParser,
    artifacts: Option<ArtifactStore>,
    session_id: String,
    config: BatchConfig,
}

impl BatchProcessor {
    pub fn new(
        store: Arc<dyn SyncStore>,
        source: Arc<dyn RemoteSource>,
        session_id: impl Into<String>,
        config: BatchConfig,
    ) -> Self {
        Self {
            store,
            source,
            parser: DocumentParser::default(),
            artifacts: None,
            session_id: session_id.into(),
            config,
        }
    }

    /// Archive raw documents that fail to parse.
    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_parser(mut self, parser: DocumentParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Process up to `batch_size` identifiers from the job's cursor,
    /// checkpointing after each one.
    pub async fn process_batch(&self, job_id: Uuid) -> Result<BatchSummary, JobError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?;
        match job.status {
            JobStatus::Running => {}
            JobStatus::Pending => return Err(JobError::NotRunning(job_id)),
            status => {
                debug!(%job_id, %status, "job not running; nothing to process");
                return Ok(BatchSummary::idle(job));
            }
        }
        self.run(job)
            .instrument(info_span!("sync_batch", %job_id))
            .await
    }

    async fn run(&self, mut job: SyncJob) -> Result<BatchSummary, JobError> {
        let started = Instant::now();
        let mut summary = BatchSummary::idle(job.clone());
        let mut still_running = true;

        for index in 0..self.config.batch_size.max(1) {
            let Some(cursor) = job.cursor.clone() else {
                break;
            };
            if index > 0 {
                if self
                    .config
                    .time_budget
                    .is_some_and(|budget| started.elapsed() >= budget)
                {
                    info!(elapsed_ms = started.elapsed().as_millis() as u64, "time budget spent");
                    summary.cut_short = true;
                    break;
                }
                if !self.config.item_delay.is_zero() {
                    tokio::time::sleep(self.config.item_delay).await;
                }
            }

            let bill = cursor.bill_id();
            let result = match self
                .process_item(&bill)
                .instrument(info_span!("sync_item", bill_id = %bill))
                .await
            {
                Ok(result) => result,
                Err(message) => return Err(self.fail(job, message).await),
            };
            record(&mut job, &mut summary, &bill, result);
            job.counters.processed += 1;
            job.advance_cursor();
            job.updated_at = Utc::now();

            let checkpoint = match self.store.save_progress(&job, &cursor).await {
                Ok(checkpoint) => checkpoint,
                Err(err) => return Err(self.fail(job, err.to_string()).await),
            };
            match checkpoint {
                Checkpoint::Saved(JobStatus::Running) => {}
                Checkpoint::Saved(status) | Checkpoint::Closed(status) => {
                    info!(%status, "job left RUNNING; stopping at checkpoint");
                    summary.cut_short = true;
                    still_running = false;
                    break;
                }
                Checkpoint::Superseded => {
                    warn!(bill_id = %bill, "another pass moved the cursor; yielding to it");
                    summary.cut_short = true;
                    still_running = false;
                    break;
                }
            }
        }

        if still_running && job.is_exhausted() {
            self.complete(&mut job).await?;
        }

        info!(
            attempted = summary.attempted,
            created = summary.created,
            updated = summary.updated,
            not_found = summary.not_found,
            errors = summary.errors,
            "batch checkpointed"
        );
        summary.job = self.store.get_job(job.id).await?.unwrap_or(job);
        Ok(summary)
    }

    /// Fetch, parse, validate and store one identifier. `Err` is a systemic
    /// failure that ends the job.
    async fn process_item(&self, bill: &BillId) -> Result<ItemResult, String> {
        let raw = match self.source.fetch_history_document(bill).await {
            Ok(raw) => raw,
            Err(err) if err.is_not_found() => {
                debug!("no history document");
                return Ok(ItemResult::NotFound);
            }
            Err(err @ SourceError::UnknownBillType(_)) => return Err(err.to_string()),
            Err(err) => return Ok(ItemResult::Failed(ItemOutcome::FetchFailed, err.to_string())),
        };

        let candidate = match self.parser.parse(&raw, bill) {
            Ok(candidate) => candidate,
            Err(err) => {
                self.archive(bill, &raw).await;
                return Ok(ItemResult::Failed(ItemOutcome::ParseFailed, err.to_string()));
            }
        };

        let violations = validate(&candidate);
        if !violations.is_empty() {
            let message = violations
                .iter()
                .map(|v| format!("{}: {}", v.field, v.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Ok(ItemResult::Failed(ItemOutcome::Invalid, message));
        }

        let full_text = match candidate.full_text_url.as_deref() {
            Some(url) if self.config.fetch_full_text => {
                match self.source.fetch_full_text(url).await {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(%url, error = %err, "full text unavailable");
                        None
                    }
                }
            }
            _ => None,
        };

        upsert(
            self.store.as_ref(),
            &self.session_id,
            &candidate,
            full_text,
            Utc::now(),
        )
        .await
        .map(ItemResult::Stored)
        .map_err(|err| err.to_string())
    }

    async fn archive(&self, bill: &BillId, raw: &[u8]) {
        let Some(artifacts) = self.artifacts.as_ref().filter(|_| self.config.archive_failures)
        else {
            return;
        };
        match artifacts
            .store_document(Utc::now(), bill, document_extension(raw), raw)
            .await
        {
            Ok(doc) => debug!(path = %doc.relative_path.display(), "archived unparsable document"),
            Err(err) => warn!(error = %err, "could not archive unparsable document"),
        }
    }

    async fn complete(&self, job: &mut SyncJob) -> Result<(), JobError> {
        let now = Utc::now();
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.updated_at = now;
        if self.store.replace_job_if(job, JobStatus::Running).await? {
            info!(job_id = %job.id, processed = job.counters.processed, "sync job completed");
        } else {
            debug!(job_id = %job.id, "job changed status before completion was recorded");
        }
        Ok(())
    }

    async fn fail(&self, mut job: SyncJob, message: String) -> JobError {
        error!(job_id = %job.id, %message, "sync job failed");
        let now = Utc::now();
        job.status = JobStatus::Error;
        job.last_error = Some(message.clone());
        job.completed_at = Some(now);
        job.updated_at = now;
        match self.store.replace_job_if(&job, JobStatus::Running).await {
            Ok(true) => {}
            Ok(false) => warn!(job_id = %job.id, "job left RUNNING before the failure was recorded"),
            Err(err) => warn!(job_id = %job.id, error = %err, "could not record job failure"),
        }
        JobError::Systemic {
            id: job.id,
            message,
        }
    }
}

fn record(job: &mut SyncJob, summary: &mut BatchSummary, bill: &BillId, result: ItemResult) {
    summary.attempted += 1;
    match result {
        ItemResult::Stored(UpsertOutcome::Created) => {
            job.counters.created += 1;
            summary.created += 1;
        }
        ItemResult::Stored(UpsertOutcome::Updated) => {
            job.counters.updated += 1;
            summary.updated += 1;
        }
        ItemResult::NotFound => {
            job.counters.skipped_not_found += 1;
            summary.not_found += 1;
        }
        ItemResult::Failed(outcome, message) => {
            warn!(bill_id = %bill, ?outcome, %message, "item failed");
            job.counters.errors += 1;
            job.last_item_error = Some(format!("{bill}: {message}"));
            summary.errors += 1;
            summary.failures.push(ItemFailure {
                bill_id: bill.to_string(),
                outcome,
                message,
            });
        }
    }
}

fn document_extension(raw: &[u8]) -> &'static str {
    let head = String::from_utf8_lossy(&raw[..raw.len().min(256)]).to_ascii_lowercase();
    let head = head.trim_start();
    if head.starts_with("<?xml") || head.starts_with("<billhistory") {
        "xml"
    } else if head.contains("<html") || head.starts_with("<!doctype") {
        "html"
    } else {
        "bin"
    }
}
