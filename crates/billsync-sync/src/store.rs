//! Persistence seam for jobs and bills.
//!
//! Every job write is conditional on the status the writer last observed.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use billsync_core::{
    BillAction, BillStatus, CommitteeReferral, JobCounters, JobStatus, StoredBill, SyncCursor,
    SyncJob, TypeRange,
};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("another sync job is already pending, running or paused")]
    ActiveJobExists,
    #[error("sync job {0} not found")]
    JobNotFound(Uuid),
    #[error("corrupt {table} row: {message}")]
    Corrupt { table: &'static str, message: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Result of [`SyncStore::save_progress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// Progress written; the job is in this status.
    Saved(JobStatus),
    /// Nothing written; the job reached this terminal status.
    Closed(JobStatus),
    /// Nothing written; another pass already moved the cursor on.
    Superseded,
}

#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Insert a new job. Fails with [`StoreError::ActiveJobExists`] when any
    /// non-terminal job is stored.
    async fn insert_job(&self, job: &SyncJob) -> Result<(), StoreError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<SyncJob>, StoreError>;

    async fn jobs_with_status(&self, statuses: &[JobStatus]) -> Result<Vec<SyncJob>, StoreError>;

    /// Replace the stored job with `job` if its stored status is still
    /// `expected`. Returns whether the write happened.
    async fn replace_job_if(&self, job: &SyncJob, expected: JobStatus) -> Result<bool, StoreError>;

    /// Persist cursor, counters and item error while the job is RUNNING or
    /// PAUSED and its stored cursor is still `from`, leaving the status alone.
    async fn save_progress(
        &self,
        job: &SyncJob,
        from: &SyncCursor,
    ) -> Result<Checkpoint, StoreError>;

    async fn ensure_session(&self, session_id: &str) -> Result<(), StoreError>;

    async fn find_bill(&self, bill_id: &str) -> Result<Option<StoredBill>, StoreError>;

    async fn insert_bill(&self, bill: &StoredBill) -> Result<(), StoreError>;

    async fn update_bill(&self, bill: &StoredBill) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<Uuid, SyncJob>,
    sessions: BTreeSet<String>,
    bills: HashMap<String, StoredBill>,
}

/// In-process store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySyncStore {
    state: Mutex<MemoryState>,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn bills(&self) -> Vec<StoredBill> {
        let state = self.state.lock().await;
        let mut bills: Vec<StoredBill> = state.bills.values().cloned().collect();
        bills.sort_by(|a, b| {
            (a.bill_type.as_str(), a.bill_number).cmp(&(b.bill_type.as_str(), b.bill_number))
        });
        bills
    }

    pub async fn sessions(&self) -> Vec<String> {
        self.state.lock().await.sessions.iter().cloned().collect()
    }

    /// Overwrite a job's status directly, bypassing transition rules.
    pub async fn force_status(&self, id: Uuid, status: JobStatus) {
        if let Some(job) = self.state.lock().await.jobs.get_mut(&id) {
            job.status = status;
        }
    }
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn insert_job(&self, job: &SyncJob) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.jobs.values().any(|j| !j.status.is_terminal()) {
            return Err(StoreError::ActiveJobExists);
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<SyncJob>, StoreError> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn jobs_with_status(&self, statuses: &[JobStatus]) -> Result<Vec<SyncJob>, StoreError> {
        let state = self.state.lock().await;
        let mut jobs: Vec<SyncJob> = state
            .jobs
            .values()
            .filter(|j| statuses.contains(&j.status))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn replace_job_if(&self, job: &SyncJob, expected: JobStatus) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&job.id) {
            Some(stored) if stored.status == expected => {
                *stored = job.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::JobNotFound(job.id)),
        }
    }

    async fn save_progress(
        &self,
        job: &SyncJob,
        from: &SyncCursor,
    ) -> Result<Checkpoint, StoreError> {
        let mut state = self.state.lock().await;
        let stored = state
            .jobs
            .get_mut(&job.id)
            .ok_or(StoreError::JobNotFound(job.id))?;
        if !matches!(stored.status, JobStatus::Running | JobStatus::Paused) {
            return Ok(Checkpoint::Closed(stored.status));
        }
        if stored.cursor.as_ref() != Some(from) {
            return Ok(Checkpoint::Superseded);
        }
        stored.cursor = job.cursor.clone();
        stored.counters = job.counters;
        stored.last_item_error = job.last_item_error.clone();
        stored.updated_at = job.updated_at;
        Ok(Checkpoint::Saved(stored.status))
    }

    async fn ensure_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .sessions
            .insert(session_id.to_string());
        Ok(())
    }

    async fn find_bill(&self, bill_id: &str) -> Result<Option<StoredBill>, StoreError> {
        Ok(self.state.lock().await.bills.get(bill_id).cloned())
    }

    async fn insert_bill(&self, bill: &StoredBill) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.sessions.contains(&bill.session_id) {
            return Err(StoreError::Corrupt {
                table: "bills",
                message: format!("unknown session {}", bill.session_id),
            });
        }
        let mut row = bill.clone();
        if let Some(existing) = state.bills.get(&bill.bill_id) {
            row.id = existing.id;
            row.created_at = existing.created_at;
        }
        state.bills.insert(bill.bill_id.clone(), row);
        Ok(())
    }

    async fn update_bill(&self, bill: &StoredBill) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .bills
            .insert(bill.bill_id.clone(), bill.clone());
        Ok(())
    }
}

/// Postgres-backed store. Schema lives in `migrations/`.
#[derive(Debug, Clone)]
pub struct PgSyncStore {
    pool: PgPool,
}

const JOB_COLUMNS: &str = "id, status, plan, cursor_type, cursor_number, processed, created, \
     updated, skipped_not_found, errors, created_at, started_at, completed_at, updated_at, \
     last_error, last_item_error";

const BILL_COLUMNS: &str = "id, bill_id, bill_type, bill_number, session_id, description, \
     primary_authors, co_authors, sponsors, co_sponsors, subjects, committees, actions, status, \
     last_action, last_action_date, last_updated, full_text_url, full_text, companion, \
     created_at, updated_at";

/// Columns an insert racing an existing row overwrites; `id` and
/// `created_at` keep the first writer's values.
const BILL_UPSERT_ASSIGNMENTS: &str = "session_id = EXCLUDED.session_id, \
     description = EXCLUDED.description, primary_authors = EXCLUDED.primary_authors, \
     co_authors = EXCLUDED.co_authors, sponsors = EXCLUDED.sponsors, \
     co_sponsors = EXCLUDED.co_sponsors, subjects = EXCLUDED.subjects, \
     committees = EXCLUDED.committees, actions = EXCLUDED.actions, status = EXCLUDED.status, \
     last_action = EXCLUDED.last_action, last_action_date = EXCLUDED.last_action_date, \
     last_updated = EXCLUDED.last_updated, full_text_url = EXCLUDED.full_text_url, \
     full_text = EXCLUDED.full_text, companion = EXCLUDED.companion, \
     updated_at = EXCLUDED.updated_at";

const UNIQUE_VIOLATION: &str = "23505";

impl PgSyncStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn status_from_text(table: &'static str, text: &str) -> Result<JobStatus, StoreError> {
    text.parse().map_err(|e| StoreError::Corrupt {
        table,
        message: format!("{e}"),
    })
}

fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn job_from_row(row: &PgRow) -> Result<SyncJob, StoreError> {
    let status: String = row.try_get("status")?;
    let plan: Json<Vec<TypeRange>> = row.try_get("plan")?;
    let cursor_type: Option<String> = row.try_get("cursor_type")?;
    let cursor_number: Option<i32> = row.try_get("cursor_number")?;
    let cursor = match (cursor_type, cursor_number) {
        (Some(bill_type), Some(number)) => Some(SyncCursor {
            bill_type,
            next_number: u32::try_from(number).map_err(|_| StoreError::Corrupt {
                table: "sync_jobs",
                message: format!("negative cursor {number}"),
            })?,
        }),
        _ => None,
    };
    Ok(SyncJob {
        id: row.try_get("id")?,
        status: status_from_text("sync_jobs", &status)?,
        plan: plan.0,
        cursor,
        counters: JobCounters {
            processed: count(row.try_get("processed")?),
            created: count(row.try_get("created")?),
            updated: count(row.try_get("updated")?),
            skipped_not_found: count(row.try_get("skipped_not_found")?),
            errors: count(row.try_get("errors")?),
        },
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        updated_at: row.try_get("updated_at")?,
        last_error: row.try_get("last_error")?,
        last_item_error: row.try_get("last_item_error")?,
    })
}

fn bill_from_row(row: &PgRow) -> Result<StoredBill, StoreError> {
    let status: String = row.try_get("status")?;
    let number: i32 = row.try_get("bill_number")?;
    let committees: Json<Vec<CommitteeReferral>> = row.try_get("committees")?;
    let actions: Json<Vec<BillAction>> = row.try_get("actions")?;
    let last_action_date: Option<NaiveDate> = row.try_get("last_action_date")?;
    let last_updated: Option<DateTime<Utc>> = row.try_get("last_updated")?;
    Ok(StoredBill {
        id: row.try_get("id")?,
        bill_id: row.try_get("bill_id")?,
        bill_type: row.try_get("bill_type")?,
        bill_number: u32::try_from(number).map_err(|_| StoreError::Corrupt {
            table: "bills",
            message: format!("bill number {number}"),
        })?,
        session_id: row.try_get("session_id")?,
        description: row.try_get("description")?,
        primary_authors: row.try_get("primary_authors")?,
        co_authors: row.try_get("co_authors")?,
        sponsors: row.try_get("sponsors")?,
        co_sponsors: row.try_get("co_sponsors")?,
        subjects: row.try_get("subjects")?,
        committees: committees.0,
        actions: actions.0,
        status: status.parse::<BillStatus>().map_err(|e| StoreError::Corrupt {
            table: "bills",
            message: e.to_string(),
        })?,
        last_action: row.try_get("last_action")?,
        last_action_date,
        last_updated,
        full_text_url: row.try_get("full_text_url")?,
        full_text: row.try_get("full_text")?,
        companion: row.try_get("companion")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn cursor_binds(job: &SyncJob) -> (Option<String>, Option<i32>) {
    match &job.cursor {
        Some(cursor) => (
            Some(cursor.bill_type.clone()),
            i32::try_from(cursor.next_number).ok(),
        ),
        None => (None, None),
    }
}

fn db_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl SyncStore for PgSyncStore {
    async fn insert_job(&self, job: &SyncJob) -> Result<(), StoreError> {
        let (cursor_type, cursor_number) = cursor_binds(job);
        let result = sqlx::query(
            r#"
            INSERT INTO sync_jobs (id, status, plan, cursor_type, cursor_number, processed,
                                   created, updated, skipped_not_found, errors, created_at,
                                   started_at, completed_at, updated_at, last_error,
                                   last_item_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(Json(&job.plan))
        .bind(cursor_type)
        .bind(cursor_number)
        .bind(db_count(job.counters.processed))
        .bind(db_count(job.counters.created))
        .bind(db_count(job.counters.updated))
        .bind(db_count(job.counters.skipped_not_found))
        .bind(db_count(job.counters.errors))
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.updated_at)
        .bind(&job.last_error)
        .bind(&job.last_item_error)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db))
                if db.code().as_deref() == Some(UNIQUE_VIOLATION)
                    && db.constraint() == Some("sync_jobs_single_active_idx") =>
            {
                Err(StoreError::ActiveJobExists)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<SyncJob>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn jobs_with_status(&self, statuses: &[JobStatus]) -> Result<Vec<SyncJob>, StoreError> {
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE status = ANY($1) ORDER BY created_at"
        ))
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn replace_job_if(&self, job: &SyncJob, expected: JobStatus) -> Result<bool, StoreError> {
        let (cursor_type, cursor_number) = cursor_binds(job);
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
               SET status = $3,
                   cursor_type = $4,
                   cursor_number = $5,
                   processed = $6,
                   created = $7,
                   updated = $8,
                   skipped_not_found = $9,
                   errors = $10,
                   started_at = $11,
                   completed_at = $12,
                   updated_at = $13,
                   last_error = $14,
                   last_item_error = $15
             WHERE id = $1
               AND status = $2
            "#,
        )
        .bind(job.id)
        .bind(expected.as_str())
        .bind(job.status.as_str())
        .bind(cursor_type)
        .bind(cursor_number)
        .bind(db_count(job.counters.processed))
        .bind(db_count(job.counters.created))
        .bind(db_count(job.counters.updated))
        .bind(db_count(job.counters.skipped_not_found))
        .bind(db_count(job.counters.errors))
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.updated_at)
        .bind(&job.last_error)
        .bind(&job.last_item_error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM sync_jobs WHERE id = $1")
            .bind(job.id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::JobNotFound(job.id)),
        }
    }

    async fn save_progress(
        &self,
        job: &SyncJob,
        from: &SyncCursor,
    ) -> Result<Checkpoint, StoreError> {
        let (cursor_type, cursor_number) = cursor_binds(job);
        let written: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE sync_jobs
               SET cursor_type = $2,
                   cursor_number = $3,
                   processed = $4,
                   created = $5,
                   updated = $6,
                   skipped_not_found = $7,
                   errors = $8,
                   last_item_error = $9,
                   updated_at = $10
             WHERE id = $1
               AND status IN ('RUNNING', 'PAUSED')
               AND cursor_type = $11
               AND cursor_number = $12
            RETURNING status
            "#,
        )
        .bind(job.id)
        .bind(cursor_type)
        .bind(cursor_number)
        .bind(db_count(job.counters.processed))
        .bind(db_count(job.counters.created))
        .bind(db_count(job.counters.updated))
        .bind(db_count(job.counters.skipped_not_found))
        .bind(db_count(job.counters.errors))
        .bind(&job.last_item_error)
        .bind(job.updated_at)
        .bind(&from.bill_type)
        .bind(i32::try_from(from.next_number).ok())
        .fetch_optional(&self.pool)
        .await?;

        if let Some((status,)) = written {
            return Ok(Checkpoint::Saved(status_from_text("sync_jobs", &status)?));
        }
        let found: Option<(String,)> = sqlx::query_as("SELECT status FROM sync_jobs WHERE id = $1")
            .bind(job.id)
            .fetch_optional(&self.pool)
            .await?;
        let (status,) = found.ok_or(StoreError::JobNotFound(job.id))?;
        let status = status_from_text("sync_jobs", &status)?;
        if status.is_terminal() {
            Ok(Checkpoint::Closed(status))
        } else {
            Ok(Checkpoint::Superseded)
        }
    }

    async fn ensure_session(&self, session_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO legislative_sessions (id)
            VALUES ($1)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_bill(&self, bill_id: &str) -> Result<Option<StoredBill>, StoreError> {
        let row = sqlx::query(&format!("SELECT {BILL_COLUMNS} FROM bills WHERE bill_id = $1"))
            .bind(bill_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(bill_from_row).transpose()
    }

    async fn insert_bill(&self, bill: &StoredBill) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO bills ({BILL_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, \
             $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22) \
             ON CONFLICT (bill_id) DO UPDATE SET {BILL_UPSERT_ASSIGNMENTS}"
        ))
        .bind(bill.id)
        .bind(&bill.bill_id)
        .bind(&bill.bill_type)
        .bind(i32::try_from(bill.bill_number).unwrap_or(i32::MAX))
        .bind(&bill.session_id)
        .bind(&bill.description)
        .bind(&bill.primary_authors)
        .bind(&bill.co_authors)
        .bind(&bill.sponsors)
        .bind(&bill.co_sponsors)
        .bind(&bill.subjects)
        .bind(Json(&bill.committees))
        .bind(Json(&bill.actions))
        .bind(bill.status.as_str())
        .bind(&bill.last_action)
        .bind(bill.last_action_date)
        .bind(bill.last_updated)
        .bind(&bill.full_text_url)
        .bind(&bill.full_text)
        .bind(&bill.companion)
        .bind(bill.created_at)
        .bind(bill.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_bill(&self, bill: &StoredBill) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE bills
               SET session_id = $2,
                   description = $3,
                   primary_authors = $4,
                   co_authors = $5,
                   sponsors = $6,
                   co_sponsors = $7,
                   subjects = $8,
                   committees = $9,
                   actions = $10,
                   status = $11,
                   last_action = $12,
                   last_action_date = $13,
                   last_updated = $14,
                   full_text_url = $15,
                   full_text = $16,
                   companion = $17,
                   updated_at = $18
             WHERE bill_id = $1
            "#,
        )
        .bind(&bill.bill_id)
        .bind(&bill.session_id)
        .bind(&bill.description)
        .bind(&bill.primary_authors)
        .bind(&bill.co_authors)
        .bind(&bill.sponsors)
        .bind(&bill.co_sponsors)
        .bind(&bill.subjects)
        .bind(Json(&bill.committees))
        .bind(Json(&bill.actions))
        .bind(bill.status.as_str())
        .bind(&bill.last_action)
        .bind(bill.last_action_date)
        .bind(bill.last_updated)
        .bind(&bill.full_text_url)
        .bind(&bill.full_text)
        .bind(&bill.companion)
        .bind(bill.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> SyncJob {
        SyncJob::new_pending(vec![TypeRange::new("HB", 1, 5)], Utc::now())
    }

    #[tokio::test]
    async fn memory_store_allows_one_non_terminal_job() {
        let store = MemorySyncStore::new();
        let first = job();
        store.insert_job(&first).await.unwrap();
        assert!(matches!(
            store.insert_job(&job()).await,
            Err(StoreError::ActiveJobExists)
        ));

        let mut done = first.clone();
        done.status = JobStatus::Stopped;
        assert!(store.replace_job_if(&done, JobStatus::Pending).await.unwrap());
        store.insert_job(&job()).await.unwrap();
    }

    #[tokio::test]
    async fn replace_is_conditional_on_observed_status() {
        let store = MemorySyncStore::new();
        let pending = job();
        store.insert_job(&pending).await.unwrap();

        let mut running = pending.clone();
        running.status = JobStatus::Running;
        assert!(!store.replace_job_if(&running, JobStatus::Paused).await.unwrap());
        assert!(store.replace_job_if(&running, JobStatus::Pending).await.unwrap());
        assert_eq!(
            store.get_job(pending.id).await.unwrap().unwrap().status,
            JobStatus::Running
        );

        let ghost = job();
        assert!(matches!(
            store.replace_job_if(&ghost, JobStatus::Pending).await,
            Err(StoreError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn progress_is_dropped_once_terminal() {
        let store = MemorySyncStore::new();
        let mut job = job();
        job.status = JobStatus::Running;
        store.insert_job(&job).await.unwrap();

        let from = job.cursor.clone().unwrap();
        job.counters.processed = 1;
        job.advance_cursor();
        assert_eq!(
            store.save_progress(&job, &from).await.unwrap(),
            Checkpoint::Saved(JobStatus::Running)
        );

        let from = job.cursor.clone().unwrap();
        store.force_status(job.id, JobStatus::Paused).await;
        job.counters.processed = 2;
        job.advance_cursor();
        assert_eq!(
            store.save_progress(&job, &from).await.unwrap(),
            Checkpoint::Saved(JobStatus::Paused)
        );
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Paused);
        assert_eq!(stored.counters.processed, 2);

        let from = job.cursor.clone().unwrap();
        store.force_status(job.id, JobStatus::Stopped).await;
        job.counters.processed = 3;
        job.advance_cursor();
        assert_eq!(
            store.save_progress(&job, &from).await.unwrap(),
            Checkpoint::Closed(JobStatus::Stopped)
        );
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.counters.processed, 2);
    }

    #[tokio::test]
    async fn stale_cursor_loses_the_checkpoint() {
        let store = MemorySyncStore::new();
        let mut job = job();
        job.status = JobStatus::Running;
        store.insert_job(&job).await.unwrap();
        let start = job.cursor.clone().unwrap();

        let mut winner = job.clone();
        winner.counters.processed = 1;
        winner.advance_cursor();
        assert_eq!(
            store.save_progress(&winner, &start).await.unwrap(),
            Checkpoint::Saved(JobStatus::Running)
        );

        let mut loser = job.clone();
        loser.counters.processed = 1;
        loser.counters.errors = 1;
        loser.advance_cursor();
        assert_eq!(
            store.save_progress(&loser, &start).await.unwrap(),
            Checkpoint::Superseded
        );
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.counters.errors, 0);
        assert_eq!(stored.cursor.unwrap().next_number, 2);
    }

    #[tokio::test]
    async fn racing_insert_keeps_the_first_row_identity() {
        let store = MemorySyncStore::new();
        store.ensure_session("89R").await.unwrap();
        let now = Utc::now();
        let bill = StoredBill {
            id: Uuid::new_v4(),
            bill_id: "HB 7".into(),
            bill_type: "HB".into(),
            bill_number: 7,
            session_id: "89R".into(),
            description: "Relating to water.".into(),
            primary_authors: vec!["Doe".into()],
            co_authors: Vec::new(),
            sponsors: Vec::new(),
            co_sponsors: Vec::new(),
            subjects: Vec::new(),
            committees: Vec::new(),
            actions: Vec::new(),
            status: BillStatus::Filed,
            last_action: None,
            last_action_date: None,
            last_updated: None,
            full_text_url: None,
            full_text: None,
            companion: None,
            created_at: now,
            updated_at: now,
        };
        store.insert_bill(&bill).await.unwrap();

        let mut late = bill.clone();
        late.id = Uuid::new_v4();
        late.description = "Relating to water rights.".into();
        store.insert_bill(&late).await.unwrap();

        let bills = store.bills().await;
        assert_eq!(bills.len(), 1);
        assert_eq!(bills[0].id, bill.id);
        assert_eq!(bills[0].created_at, bill.created_at);
        assert_eq!(bills[0].description, "Relating to water rights.");
    }

    /// Runs against a scratch database named by `DATABASE_URL`:
    /// `cargo test -p billsync-sync -- --ignored`.
    #[tokio::test]
    #[ignore = "needs a Postgres database at DATABASE_URL"]
    async fn postgres_store_guards_job_writes() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let store = PgSyncStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        sqlx::query("DELETE FROM sync_jobs")
            .execute(&store.pool)
            .await
            .unwrap();

        let first = job();
        store.insert_job(&first).await.unwrap();
        assert!(matches!(
            store.insert_job(&job()).await,
            Err(StoreError::ActiveJobExists)
        ));

        let mut running = first.clone();
        running.status = JobStatus::Running;
        assert!(!store.replace_job_if(&running, JobStatus::Paused).await.unwrap());
        assert!(store.replace_job_if(&running, JobStatus::Pending).await.unwrap());

        let start = running.cursor.clone().unwrap();
        let mut winner = running.clone();
        winner.counters.processed = 1;
        winner.counters.created = 1;
        winner.advance_cursor();
        assert_eq!(
            store.save_progress(&winner, &start).await.unwrap(),
            Checkpoint::Saved(JobStatus::Running)
        );
        assert_eq!(
            store.save_progress(&winner, &start).await.unwrap(),
            Checkpoint::Superseded
        );

        let mut stopped = winner.clone();
        stopped.status = JobStatus::Stopped;
        assert!(store.replace_job_if(&stopped, JobStatus::Running).await.unwrap());
        let from = winner.cursor.clone().unwrap();
        winner.advance_cursor();
        assert_eq!(
            store.save_progress(&winner, &from).await.unwrap(),
            Checkpoint::Closed(JobStatus::Stopped)
        );

        let stored = store.get_job(first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Stopped);
        assert_eq!(stored.counters.processed, 1);
        assert_eq!(stored.cursor.unwrap().next_number, 2);
        store.insert_job(&job()).await.unwrap();
    }
}
