use billsync_core::JobStatus;
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("sync job {0} not found")]
    NotFound(Uuid),
    #[error("sync job {existing} is already {status}")]
    Conflict { existing: Uuid, status: JobStatus },
    #[error("cannot {action} sync job {id} while it is {status}")]
    InvalidTransition {
        id: Uuid,
        action: &'static str,
        status: JobStatus,
    },
    #[error("sync job {0} has not been started")]
    NotRunning(Uuid),
    #[error("sync job {id} failed: {message}")]
    Systemic { id: Uuid, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}
