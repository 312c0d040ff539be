//! Error taxonomy for store and ledger operations.
//!
//! Every registry/ledger call returns exactly one of these variants, and
//! the consumer layer maps each variant onto an ack/nack disposition.

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Malformed event. Rejected before any store write happens; the bus
    /// layer bounds redelivery.
    #[error("Invalid event: {0}")]
    Validation(String),

    /// A job with this id already exists in the registry or archive.
    #[error("Job {0} already exists in the job store")]
    DuplicateJob(Uuid),

    /// An expectation for this (job, key) pair was already recorded.
    #[error("Key '{key}' already recorded for job {job_id}")]
    DuplicateKey { job_id: Uuid, key: String },

    /// A status for this (job, file) pair was already recorded.
    #[error("File {file_id} already recorded for job {job_id}")]
    DuplicateFile { job_id: Uuid, file_id: Uuid },

    /// The job has reached a terminal state; no further events are accepted.
    #[error("Job {job_id} is {state}, event is moot")]
    JobAlreadyTerminal { job_id: Uuid, state: &'static str },

    #[error("Job {0} not found in the job store")]
    NotFound(Uuid),

    /// Duplicate failure delivery. Rejected so it stays observable, but the
    /// original failure info is left untouched.
    #[error("Job {0} is already marked as failed")]
    AlreadyFailed(Uuid),

    #[error("Job {job_id} is not ready for completion (currently {status})")]
    NotReady { job_id: Uuid, status: String },

    /// A write the backing store should have acknowledged was not applied.
    /// Fatal: there is no safe partial-completion fallback, so the host must
    /// be allowed to crash and restart.
    #[error("Store inconsistency: {0}")]
    StoreInconsistency(String),

    /// A multi-step transaction failed to commit. No partial effect
    /// occurred; the caller may retry the whole operation.
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Errors with no automatic recovery path. The watcher stops and the
    /// host is expected to restart rather than continue in an unknown state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::StoreInconsistency(_) | StoreError::Database(_) | StoreError::Sqlite(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let job_id = Uuid::new_v4();
        assert!(StoreError::StoreInconsistency("missing ack".into()).is_fatal());
        assert!(!StoreError::DuplicateJob(job_id).is_fatal());
        assert!(!StoreError::Validation("bad".into()).is_fatal());
        assert!(!StoreError::TransactionAborted("busy".into()).is_fatal());
    }

    #[test]
    fn test_display_includes_ids() {
        let job_id = Uuid::new_v4();
        let msg = StoreError::DuplicateKey {
            job_id,
            key: "1.2.3".into(),
        }
        .to_string();
        assert!(msg.contains("1.2.3"));
        assert!(msg.contains(&job_id.to_string()));
    }
}
