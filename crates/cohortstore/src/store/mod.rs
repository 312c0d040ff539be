//! The extract job store facade.
//!
//! Composes the registry, the two per-job ledgers, the archive, and the
//! verification write buffer behind one handle. All status decisions (what
//! state a job is in, and when that state may change) happen here; callers
//! only feed events in and poll for readiness.

mod buffer;

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::{archive, expectation_ledger, registry, status_ledger, Database};
use crate::db::archive::{FileAnonFailureInfo, FileVerificationFailureInfo, KeyRejectionInfo};
use crate::error::{Result, StoreError};
use crate::events::{
    DeliveryToken, FileStatusReported, FileVerified, JobSubmitted, KeyResolved,
};
use crate::model::{CompletedJobRecord, ExtractJobRecord, ExtractJobStatus, JobFailureInfo};

use buffer::VerificationWriteBuffer;

pub struct ExtractJobStore {
    db: Database,
    clock: Arc<dyn Clock>,
    write_buffer: VerificationWriteBuffer,
    /// Serializes flushes; a flush in progress makes a concurrent trigger a
    /// queued no-op rather than an overlapping write.
    flush_lock: std::sync::Mutex<()>,
}

impl ExtractJobStore {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Result<Self> {
        let existing = db.with_conn(registry::count)?;
        if existing > 0 {
            info!(existing, "Connected to job store with existing jobs");
        } else {
            info!("Empty job store created successfully");
        }

        Ok(Self {
            db,
            clock,
            write_buffer: VerificationWriteBuffer::new(),
            flush_lock: std::sync::Mutex::new(()),
        })
    }

    pub fn with_system_clock(db: Database) -> Result<Self> {
        Self::new(db, Arc::new(crate::clock::SystemClock))
    }

    /// Rejects writes against a job that can no longer change: archived
    /// (completed) or failed. A job absent from both is accepted, since
    /// events legitimately arrive before the job info itself.
    fn ensure_not_terminal(conn: &rusqlite::Connection, job_id: Uuid) -> Result<()> {
        if archive::contains(conn, job_id)? {
            return Err(StoreError::JobAlreadyTerminal {
                job_id,
                state: "completed",
            });
        }
        if let Some(job) = registry::get(conn, job_id)? {
            if job.status == ExtractJobStatus::Failed {
                return Err(StoreError::JobAlreadyTerminal {
                    job_id,
                    state: "failed",
                });
            }
        }
        Ok(())
    }

    // ─── Event persistence ──────────────────────────────────────────────────

    pub fn persist_job_submitted(&self, event: &JobSubmitted) -> Result<()> {
        event.validate()?;
        info!(job_id = %event.job_id, key_count = event.key_count, "Received new job info");
        self.db.with_conn(|conn| {
            if archive::contains(conn, event.job_id)? {
                return Err(StoreError::DuplicateJob(event.job_id));
            }
            registry::insert(conn, &event.to_record())
        })
    }

    pub fn persist_key_resolved(&self, event: &KeyResolved) -> Result<()> {
        event.validate()?;
        self.db.with_conn(|conn| {
            Self::ensure_not_terminal(conn, event.job_id)?;
            expectation_ledger::record_expectation(conn, &event.to_record())
        })
    }

    pub fn persist_file_status(&self, event: &FileStatusReported) -> Result<()> {
        event.validate()?;
        self.db.with_conn(|conn| {
            Self::ensure_not_terminal(conn, event.job_id)?;
            status_ledger::record_status(conn, &event.to_record())
        })
    }

    /// Direct (unbatched) write path for a verification outcome.
    pub fn persist_file_verified(&self, event: &FileVerified) -> Result<()> {
        event.validate()?;
        self.db.with_conn(|conn| {
            Self::ensure_not_terminal(conn, event.job_id)?;
            status_ledger::record_status(conn, &event.to_record())
        })
    }

    // ─── Verification write buffer ──────────────────────────────────────────

    /// Buffers a verification outcome for the next flush. The delivery token
    /// is only released once the record has actually landed.
    pub fn queue_file_verified(&self, event: &FileVerified, token: DeliveryToken) -> Result<()> {
        event.validate()?;
        self.db
            .with_conn(|conn| Self::ensure_not_terminal(conn, event.job_id))?;
        self.write_buffer.push(event.to_record(), token);
        Ok(())
    }

    pub fn pending_verification_count(&self) -> usize {
        self.write_buffer.pending_count()
    }

    /// Writes every buffered verification record in one transaction. On
    /// success all buffered tokens are released in submission order; on
    /// failure none are, the records stay queued, and the bus will redeliver.
    /// Returns the number of records written.
    pub fn flush_verification_queue(&self) -> Result<usize> {
        let _guard = self
            .flush_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let items = self.write_buffer.take_pending();
        if items.is_empty() {
            return Ok(0);
        }
        let count = items.len();
        debug!(count, "Flushing verification write queue");

        let records: Vec<_> = items.iter().map(|item| item.record.clone()).collect();
        let result = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            status_ledger::insert_many(&tx, &records)?;
            tx.commit()
                .map_err(|e| StoreError::TransactionAborted(e.to_string()))
        });

        match result {
            Ok(()) => {
                self.write_buffer.release(items);
                Ok(count)
            }
            Err(e) => {
                self.write_buffer.restore(items);
                Err(e)
            }
        }
    }

    /// Tokens released by successful flushes, in original submission order.
    pub fn drain_processed_tokens(&self) -> Vec<DeliveryToken> {
        self.write_buffer.drain_processed()
    }

    // ─── Completeness evaluation ────────────────────────────────────────────

    /// Evaluates every active job once, advancing it at most one phase, and
    /// returns the jobs sitting in ReadyForChecks afterwards. A job whose
    /// completion previously aborted stays ready and is returned again.
    pub fn ready_jobs(&self) -> Result<Vec<ExtractJobRecord>> {
        self.db.with_conn(|conn| {
            let mut ready = Vec::new();

            for mut job in registry::active_jobs(conn)? {
                let job_id = job.job_id;
                if job.status == ExtractJobStatus::Failed {
                    warn!(%job_id, "Job is marked as failed, skipping");
                    continue;
                }

                debug!(%job_id, status = %job.status, "Checking progress");

                let next = match job.status {
                    ExtractJobStatus::WaitingForCollectionInfo => {
                        let (keys_recorded, _) = expectation_ledger::completeness(conn, job_id)?;
                        if keys_recorded == u64::from(job.key_count) {
                            Some(ExtractJobStatus::WaitingForStatuses)
                        } else {
                            debug!(
                                %job_id,
                                expected = job.key_count,
                                actual = keys_recorded,
                                "Still waiting for collection info"
                            );
                            None
                        }
                    }
                    ExtractJobStatus::WaitingForStatuses => {
                        let (_, expected_statuses) =
                            expectation_ledger::completeness(conn, job_id)?;
                        let actual_statuses = status_ledger::count(conn, job_id)?;
                        if actual_statuses == expected_statuses {
                            Some(ExtractJobStatus::ReadyForChecks)
                        } else {
                            debug!(
                                %job_id,
                                expected = expected_statuses,
                                actual = actual_statuses,
                                "Still waiting for file statuses"
                            );
                            None
                        }
                    }
                    _ => None,
                };

                if let Some(next) = next {
                    debug!(%job_id, from = %job.status, to = %next, "Advancing job");
                    registry::update_status(conn, job_id, next)?;
                    job.status = next;
                }

                if job.status == ExtractJobStatus::ReadyForChecks {
                    ready.push(job);
                }
            }

            Ok(ready)
        })
    }

    // ─── End-of-life transitions ────────────────────────────────────────────

    /// Atomically completes a ready job: seals it into the archive (with the
    /// ledger copies), removes it from the registry, and drops both ledger
    /// partitions. All steps commit or abort together; after an abort the
    /// job is exactly as it was and the call may be retried.
    pub fn mark_job_completed(&self, job_id: Uuid) -> Result<CompletedJobRecord> {
        let completed_at = self.clock.utc_now();

        let sealed = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let job = registry::get(&tx, job_id)?.ok_or(StoreError::NotFound(job_id))?;
            if job.status != ExtractJobStatus::ReadyForChecks {
                return Err(StoreError::NotReady {
                    job_id,
                    status: job.status.to_string(),
                });
            }

            let sealed = CompletedJobRecord::seal(job, completed_at);
            archive::insert_completed_job(&tx, &sealed)?;
            archive::copy_expectations(&tx, job_id)?;
            archive::copy_statuses(&tx, job_id)?;
            registry::delete(&tx, job_id)?;
            expectation_ledger::drop_partition(&tx, job_id)?;
            status_ledger::drop_partition(&tx, job_id)?;

            tx.commit()
                .map_err(|e| StoreError::TransactionAborted(e.to_string()))?;
            Ok(sealed)
        })?;

        info!(%job_id, "Marked job as completed");
        Ok(sealed)
    }

    /// Atomically marks a job as failed, recording the diagnostic chain.
    /// Failed is absorbing: a second failure is rejected and the original
    /// info kept.
    pub fn mark_job_failed(&self, job_id: Uuid, cause: &dyn std::error::Error) -> Result<()> {
        let info = JobFailureInfo::from_error(cause, self.clock.utc_now());

        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            registry::record_failure(&tx, job_id, &info)?;
            tx.commit()
                .map_err(|e| StoreError::TransactionAborted(e.to_string()))
        })?;

        info!(%job_id, "Marked job as failed");
        Ok(())
    }

    // ─── Completed-job queries ──────────────────────────────────────────────

    pub fn completed_job_info(&self, job_id: Uuid) -> Result<CompletedJobRecord> {
        self.db.with_conn(|conn| archive::completed_job_info(conn, job_id))
    }

    pub fn completed_job_rejections(&self, job_id: Uuid) -> Result<Vec<KeyRejectionInfo>> {
        self.db
            .with_conn(|conn| archive::completed_job_rejections(conn, job_id))
    }

    pub fn completed_job_anonymisation_failures(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<FileAnonFailureInfo>> {
        self.db
            .with_conn(|conn| archive::completed_job_anonymisation_failures(conn, job_id))
    }

    pub fn completed_job_verification_failures(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<FileVerificationFailureInfo>> {
        self.db
            .with_conn(|conn| archive::completed_job_verification_failures(conn, job_id))
    }

    /// Lookup used by tests and the watcher; `None` once a job has left the
    /// registry.
    pub fn job_info(&self, job_id: Uuid) -> Result<Option<ExtractJobRecord>> {
        self.db.with_conn(|conn| registry::get(conn, job_id))
    }
}
