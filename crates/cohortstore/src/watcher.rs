//! Periodic completeness evaluation and completion driving.
//!
//! The watcher owns the single poll loop: each tick asks the store which
//! jobs have become ready, completes each one, and notifies the downstream
//! sink. One bad job never halts the rest of a poll; an unrecoverable store
//! fault stops the watcher and surfaces through the fatal callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::model::{CompletedJobRecord, ExtractJobRecord};
use crate::store::ExtractJobStore;

/// The store surface the watcher drives.
pub trait CompletionStore: Send + Sync {
    fn ready_jobs(&self) -> Result<Vec<ExtractJobRecord>>;
    fn mark_job_completed(&self, job_id: Uuid) -> Result<CompletedJobRecord>;
    fn mark_job_failed(&self, job_id: Uuid, cause: &StoreError) -> Result<()>;
}

impl CompletionStore for ExtractJobStore {
    fn ready_jobs(&self) -> Result<Vec<ExtractJobRecord>> {
        ExtractJobStore::ready_jobs(self)
    }

    fn mark_job_completed(&self, job_id: Uuid) -> Result<CompletedJobRecord> {
        ExtractJobStore::mark_job_completed(self, job_id)
    }

    fn mark_job_failed(&self, job_id: Uuid, cause: &StoreError) -> Result<()> {
        ExtractJobStore::mark_job_failed(self, job_id, cause)
    }
}

/// Downstream seam notified once a job has been sealed into the archive.
/// The reporting stage hangs off this.
pub trait JobCompleteSink: Send + Sync {
    fn on_job_completed(&self, job: &CompletedJobRecord);
}

/// Sink that drops every notification. Useful for tests and tooling.
pub struct NoopSink;

impl JobCompleteSink for NoopSink {
    fn on_job_completed(&self, _job: &CompletedJobRecord) {}
}

pub type FatalErrorCallback = Box<dyn Fn(&StoreError) + Send + Sync>;

struct WatcherInner {
    store: Arc<dyn CompletionStore>,
    sink: Box<dyn JobCompleteSink>,
    on_fatal: FatalErrorCallback,
    /// Polls never overlap: the loop thread and any manual `process_jobs`
    /// call take this lock for the whole poll.
    poll_lock: Mutex<()>,
    stopped: AtomicBool,
}

impl WatcherInner {
    fn process_jobs(&self) {
        let _guard = self
            .poll_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if self.stopped.load(Ordering::Relaxed) {
            return;
        }

        let ready = match self.store.ready_jobs() {
            Ok(ready) => ready,
            Err(e) => {
                error!(error = %e, "Failed to evaluate job readiness");
                self.fatal(&e);
                return;
            }
        };

        if ready.is_empty() {
            debug!("No jobs ready for checks");
        }

        for job in ready {
            self.complete_job(job.job_id);
            if self.stopped.load(Ordering::Relaxed) {
                return;
            }
        }
    }

    fn complete_job(&self, job_id: Uuid) {
        info!(%job_id, "All files for job present, running completion tasks");

        match self.store.mark_job_completed(job_id) {
            Ok(sealed) => {
                self.sink.on_job_completed(&sealed);
            }
            Err(e) if e.is_fatal() => {
                error!(%job_id, error = %e, "Unrecoverable error while completing job");
                self.fatal(&e);
            }
            Err(e @ StoreError::TransactionAborted(_)) => {
                // No partial effect; the job is still ready and the next
                // poll retries the whole completion.
                warn!(%job_id, error = %e, "Completion transaction aborted, will retry");
            }
            Err(e) => {
                warn!(%job_id, error = %e, "Issue with job, marking as failed");
                match self.store.mark_job_failed(job_id, &e) {
                    Ok(()) => {}
                    Err(StoreError::AlreadyFailed(_)) => {
                        debug!(%job_id, "Job was already marked as failed");
                    }
                    Err(fail_err) if fail_err.is_fatal() => {
                        error!(%job_id, error = %fail_err, "Failed to record job failure");
                        self.fatal(&fail_err);
                    }
                    Err(fail_err) => {
                        error!(%job_id, error = %fail_err, "Failed to record job failure");
                    }
                }
            }
        }
    }

    fn fatal(&self, e: &StoreError) {
        self.stopped.store(true, Ordering::Relaxed);
        (self.on_fatal)(e);
    }
}

/// Timer-driven poll loop over the job store.
pub struct JobWatcher {
    inner: Arc<WatcherInner>,
    shutdown_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl JobWatcher {
    /// Starts the watcher: one synchronous initial poll, then a background
    /// tick every `poll_interval`.
    pub fn start(
        store: Arc<dyn CompletionStore>,
        sink: Box<dyn JobCompleteSink>,
        on_fatal: FatalErrorCallback,
        poll_interval: Duration,
    ) -> Self {
        let inner = Arc::new(WatcherInner {
            store,
            sink,
            on_fatal,
            poll_lock: Mutex::new(()),
            stopped: AtomicBool::new(false),
        });

        debug!("JobWatcher starting");
        inner.process_jobs();

        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let loop_inner = Arc::clone(&inner);
        let handle = std::thread::spawn(move || loop {
            match shutdown_rx.recv_timeout(poll_interval) {
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if loop_inner.stopped.load(Ordering::Relaxed) {
                        break;
                    }
                    debug!("Checking job statuses");
                    loop_inner.process_jobs();
                }
                Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        });

        Self {
            inner,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Runs one poll synchronously, serialized against the timer loop.
    pub fn process_jobs(&self) {
        self.inner.process_jobs();
    }

    /// True once a fatal error has halted polling.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Relaxed)
    }

    /// Halts scheduling of further polls and joins the loop thread. An
    /// in-flight poll runs to completion first.
    pub fn stop(&mut self, reason: &str) {
        info!(reason, "Stopping job watcher");
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Job watcher thread panicked");
            }
        }
    }
}

impl Drop for JobWatcher {
    fn drop(&mut self) {
        self.stop("watcher dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::db::Database;
    use crate::events::{FileVerified, JobSubmitted, KeyResolved};
    use crate::model::{ExpectedFile, ExtractJobStatus, VerifiedFileStatus};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    // Long enough that only manual polls run during a test.
    const MANUAL_ONLY: Duration = Duration::from_secs(3600);

    #[derive(Clone)]
    struct RecordingSink {
        completed: Arc<StdMutex<Vec<Uuid>>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                completed: Arc::new(StdMutex::new(Vec::new())),
            }
        }

        fn completed_ids(&self) -> Vec<Uuid> {
            self.completed.lock().unwrap().clone()
        }
    }

    impl JobCompleteSink for RecordingSink {
        fn on_job_completed(&self, job: &CompletedJobRecord) {
            self.completed.lock().unwrap().push(job.job.job_id);
        }
    }

    fn sample_record(job_id: Uuid, status: ExtractJobStatus) -> ExtractJobRecord {
        ExtractJobRecord {
            job_id,
            status,
            project_number: "2026-0001".to_string(),
            extraction_directory: "2026-0001/extract1".to_string(),
            submitted_at: Utc.with_ymd_and_hms(2026, 2, 3, 9, 0, 0).unwrap(),
            key_tag: "SeriesInstanceUID".to_string(),
            key_count: 1,
            user_name: "testuser".to_string(),
            modality: None,
            is_identifiable: false,
            is_no_filter: false,
            failure_info: None,
        }
    }

    /// Scripted store for exercising the watcher's error handling without a
    /// real database.
    struct ScriptedStore {
        ready: StdMutex<Vec<ExtractJobRecord>>,
        fail_completion_for: Vec<Uuid>,
        failed: StdMutex<Vec<Uuid>>,
    }

    impl ScriptedStore {
        fn new(ready: Vec<ExtractJobRecord>, fail_completion_for: Vec<Uuid>) -> Arc<Self> {
            Arc::new(Self {
                ready: StdMutex::new(ready),
                fail_completion_for,
                failed: StdMutex::new(Vec::new()),
            })
        }
    }

    impl CompletionStore for ScriptedStore {
        fn ready_jobs(&self) -> Result<Vec<ExtractJobRecord>> {
            Ok(self.ready.lock().unwrap().clone())
        }

        fn mark_job_completed(&self, job_id: Uuid) -> Result<CompletedJobRecord> {
            if self.fail_completion_for.contains(&job_id) {
                return Err(StoreError::NotReady {
                    job_id,
                    status: "waiting_for_statuses".to_string(),
                });
            }
            let mut ready = self.ready.lock().unwrap();
            let job = ready
                .iter()
                .find(|j| j.job_id == job_id)
                .cloned()
                .ok_or(StoreError::NotFound(job_id))?;
            ready.retain(|j| j.job_id != job_id);
            Ok(CompletedJobRecord::seal(
                job,
                Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 0).unwrap(),
            ))
        }

        fn mark_job_failed(&self, job_id: Uuid, _cause: &StoreError) -> Result<()> {
            self.failed.lock().unwrap().push(job_id);
            self.ready.lock().unwrap().retain(|j| j.job_id != job_id);
            Ok(())
        }
    }

    fn test_store() -> Arc<ExtractJobStore> {
        let db = Database::open_in_memory().expect("Failed to create test database");
        let clock = FixedClock(Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 0).unwrap());
        Arc::new(ExtractJobStore::new(db, Arc::new(clock)).unwrap())
    }

    fn submit_full_job(store: &ExtractJobStore, job_id: Uuid, file_count: usize) {
        store
            .persist_job_submitted(&JobSubmitted {
                job_id,
                project_number: "2026-0001".to_string(),
                extraction_directory: "2026-0001/extract1".to_string(),
                submitted_at: Utc.with_ymd_and_hms(2026, 2, 3, 9, 0, 0).unwrap(),
                key_tag: "SeriesInstanceUID".to_string(),
                key_count: 1,
                user_name: "testuser".to_string(),
                modality: None,
                is_identifiable: false,
                is_no_filter: false,
            })
            .unwrap();

        let file_ids: Vec<Uuid> = (0..file_count).map(|_| Uuid::new_v4()).collect();
        store
            .persist_key_resolved(&KeyResolved {
                job_id,
                key: "S1".to_string(),
                files: file_ids
                    .iter()
                    .map(|&file_id| ExpectedFile {
                        file_id,
                        output_path: format!("S1/{}.dcm", file_id.simple()),
                    })
                    .collect(),
                rejection_reasons: BTreeMap::new(),
            })
            .unwrap();

        for file_id in file_ids {
            store
                .persist_file_verified(&FileVerified {
                    job_id,
                    file_id,
                    source_path: format!("src/{}.dcm", file_id.simple()),
                    output_path: format!("out/{}.dcm", file_id.simple()),
                    verified_status: VerifiedFileStatus::NotIdentifiable,
                    report: "[]".to_string(),
                })
                .unwrap();
        }
    }

    fn start_watcher<S: CompletionStore + 'static>(
        store: Arc<S>,
        sink: RecordingSink,
    ) -> (JobWatcher, Arc<StdMutex<Vec<String>>>) {
        let fatals = Arc::new(StdMutex::new(Vec::new()));
        let fatals_cb = Arc::clone(&fatals);
        let watcher = JobWatcher::start(
            store,
            Box::new(sink),
            Box::new(move |e| fatals_cb.lock().unwrap().push(e.to_string())),
            MANUAL_ONLY,
        );
        (watcher, fatals)
    }

    #[test]
    fn test_completes_ready_job_and_notifies_sink() {
        let store = test_store();
        let sink = RecordingSink::new();
        let job_id = Uuid::new_v4();
        submit_full_job(&store, job_id, 2);

        let (mut watcher, fatals) = start_watcher(Arc::clone(&store), sink.clone());

        // The initial poll advanced the collection phase; two more finish
        // the job.
        watcher.process_jobs();
        watcher.process_jobs();

        assert_eq!(sink.completed_ids(), vec![job_id]);
        assert!(store.job_info(job_id).unwrap().is_none());
        assert!(store.completed_job_info(job_id).is_ok());
        assert!(fatals.lock().unwrap().is_empty());

        watcher.stop("test finished");
    }

    #[test]
    fn test_no_ready_jobs_is_quiet() {
        let store = test_store();
        let sink = RecordingSink::new();
        let (mut watcher, fatals) = start_watcher(Arc::clone(&store), sink.clone());

        watcher.process_jobs();
        assert!(sink.completed_ids().is_empty());
        assert!(fatals.lock().unwrap().is_empty());
        assert!(!watcher.is_stopped());

        watcher.stop("test finished");
    }

    #[test]
    fn test_problem_job_is_failed_and_others_continue() {
        let healthy = Uuid::new_v4();
        let broken = Uuid::new_v4();
        let store = ScriptedStore::new(
            vec![
                sample_record(broken, ExtractJobStatus::ReadyForChecks),
                sample_record(healthy, ExtractJobStatus::ReadyForChecks),
            ],
            vec![broken],
        );
        let sink = RecordingSink::new();

        let (mut watcher, fatals) = start_watcher(Arc::clone(&store), sink.clone());

        // The initial poll already ran: the broken job was marked failed and
        // the healthy one completed.
        assert_eq!(store.failed.lock().unwrap().clone(), vec![broken]);
        assert_eq!(sink.completed_ids(), vec![healthy]);
        assert!(fatals.lock().unwrap().is_empty());
        assert!(!watcher.is_stopped());

        watcher.stop("test finished");
    }

    #[test]
    fn test_fatal_error_stops_watcher() {
        let store = test_store();
        let sink = RecordingSink::new();

        // A key that resolved to zero files reaches readiness with no status
        // partition at all; completion then hits a store inconsistency.
        let job_id = Uuid::new_v4();
        store
            .persist_job_submitted(&JobSubmitted {
                job_id,
                project_number: "2026-0001".to_string(),
                extraction_directory: "2026-0001/extract1".to_string(),
                submitted_at: Utc.with_ymd_and_hms(2026, 2, 3, 9, 0, 0).unwrap(),
                key_tag: "SeriesInstanceUID".to_string(),
                key_count: 1,
                user_name: "testuser".to_string(),
                modality: None,
                is_identifiable: false,
                is_no_filter: false,
            })
            .unwrap();
        store
            .persist_key_resolved(&KeyResolved {
                job_id,
                key: "S1".to_string(),
                files: Vec::new(),
                rejection_reasons: BTreeMap::new(),
            })
            .unwrap();

        let (mut watcher, fatals) = start_watcher(Arc::clone(&store), sink.clone());

        watcher.process_jobs();
        watcher.process_jobs();

        assert!(watcher.is_stopped());
        let fatals = fatals.lock().unwrap();
        assert_eq!(fatals.len(), 1);
        assert!(fatals[0].contains("inconsistency") || fatals[0].contains("Store"));
        drop(fatals);

        // The abort left the job in place.
        let job = store.job_info(job_id).unwrap().unwrap();
        assert_eq!(job.status, ExtractJobStatus::ReadyForChecks);
        assert!(store.completed_job_info(job_id).is_err());
        assert!(sink.completed_ids().is_empty());

        watcher.stop("test finished");
    }

    #[test]
    fn test_stop_halts_scheduling() {
        let store = test_store();
        let sink = RecordingSink::new();
        let (mut watcher, _fatals) = start_watcher(Arc::clone(&store), sink.clone());

        watcher.stop("shutting down");
        // Stopping twice is harmless.
        watcher.stop("shutting down again");

        // A job arriving after stop is only picked up by manual polls.
        let job_id = Uuid::new_v4();
        submit_full_job(&store, job_id, 1);
        watcher.process_jobs();
        watcher.process_jobs();
        assert_eq!(sink.completed_ids(), vec![job_id]);
    }
}
