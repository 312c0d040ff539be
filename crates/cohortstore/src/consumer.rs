//! Per-event-type consumers.
//!
//! Each inbound event type has one logical consumer. A consumer performs
//! the matching store operation and decides what should happen to the bus
//! delivery: acknowledge, reject, or defer (buffered verification path).
//! The transport that actually acks and redelivers lives outside this
//! crate.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, error, warn};

use crate::error::StoreError;
use crate::events::{
    DeliveryToken, FileStatusReported, FileVerified, JobSubmitted, KeyResolved,
};
use crate::store::ExtractJobStore;

/// What the transport should do with a delivery.
#[derive(Debug)]
pub enum Disposition {
    /// Acknowledge: the event was persisted, or can never be (duplicates
    /// and events against terminal jobs; acking prevents a poison-message
    /// loop).
    Ack,
    /// Reject without ack; the bus layer bounds redelivery.
    Nack,
    /// No decision yet: the event is buffered and its token will surface via
    /// `VerificationConsumer::drain_acks` after a successful flush.
    Deferred,
    /// Unrecoverable store fault. The host must stop rather than continue in
    /// an unknown state.
    Fatal(StoreError),
}

/// Maps a store outcome onto a delivery disposition.
fn disposition_for(result: Result<(), StoreError>) -> Disposition {
    match result {
        Ok(()) => Disposition::Ack,
        Err(
            e @ (StoreError::DuplicateJob(_)
            | StoreError::DuplicateKey { .. }
            | StoreError::DuplicateFile { .. }),
        ) => {
            // Redelivery can never resolve a duplicate.
            warn!(error = %e, "Duplicate record, acking");
            Disposition::Ack
        }
        Err(e @ StoreError::JobAlreadyTerminal { .. }) => {
            warn!(error = %e, "Event for terminal job, acking");
            Disposition::Ack
        }
        Err(e @ StoreError::AlreadyFailed(_)) => {
            warn!(error = %e, "Duplicate failure delivery, acking");
            Disposition::Ack
        }
        Err(e) if e.is_fatal() => {
            error!(error = %e, "Fatal store error while processing event");
            Disposition::Fatal(e)
        }
        Err(e) => {
            warn!(error = %e, "Rejecting event");
            Disposition::Nack
        }
    }
}

/// Consumer for `JobSubmitted` events.
pub struct JobInfoConsumer {
    store: Arc<ExtractJobStore>,
}

impl JobInfoConsumer {
    pub fn new(store: Arc<ExtractJobStore>) -> Self {
        Self { store }
    }

    pub fn process_message(&self, event: &JobSubmitted) -> Disposition {
        disposition_for(self.store.persist_job_submitted(event))
    }
}

/// Consumer for `KeyResolved` events.
pub struct KeyInfoConsumer {
    store: Arc<ExtractJobStore>,
}

impl KeyInfoConsumer {
    pub fn new(store: Arc<ExtractJobStore>) -> Self {
        Self { store }
    }

    pub fn process_message(&self, event: &KeyResolved) -> Disposition {
        disposition_for(self.store.persist_key_resolved(event))
    }
}

/// Consumer for `FileStatusReported` events (the direct, unbuffered path).
pub struct FileStatusConsumer {
    store: Arc<ExtractJobStore>,
}

impl FileStatusConsumer {
    pub fn new(store: Arc<ExtractJobStore>) -> Self {
        Self { store }
    }

    pub fn process_message(&self, event: &FileStatusReported) -> Disposition {
        disposition_for(self.store.persist_file_status(event))
    }
}

/// Consumer for `FileVerified` events.
///
/// In batched mode events are buffered and written in bulk; their tokens
/// surface via `drain_acks` once a flush lands. Unbatched mode writes each
/// event directly and decides the disposition immediately. Flushes trigger
/// on the pending-count threshold and on a timer; a tick that finds a flush
/// already running is skipped rather than overlapped.
pub struct VerificationConsumer {
    store: Arc<ExtractJobStore>,
    process_batches: bool,
    max_unacknowledged: usize,
    shutdown_tx: Option<Sender<()>>,
    flush_thread: Option<JoinHandle<()>>,
}

impl VerificationConsumer {
    pub fn new(
        store: Arc<ExtractJobStore>,
        process_batches: bool,
        max_unacknowledged: usize,
        flush_interval: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let flush_thread = if process_batches {
            let store = Arc::clone(&store);
            Some(std::thread::spawn(move || loop {
                match shutdown_rx.recv_timeout(flush_interval) {
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        if let Err(e) = store.flush_verification_queue() {
                            error!(error = %e, "Timed flush of verification queue failed");
                        }
                    }
                    Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                        debug!("Verification flush timer stopping");
                        break;
                    }
                }
            }))
        } else {
            None
        };

        Self {
            store,
            process_batches,
            max_unacknowledged,
            shutdown_tx: Some(shutdown_tx),
            flush_thread,
        }
    }

    pub fn process_message(&self, event: &FileVerified, token: DeliveryToken) -> Disposition {
        if !self.process_batches {
            return disposition_for(self.store.persist_file_verified(event));
        }

        match self.store.queue_file_verified(event, token) {
            Ok(()) => {
                if self.store.pending_verification_count() >= self.max_unacknowledged {
                    if let Err(e) = self.store.flush_verification_queue() {
                        error!(error = %e, "Threshold flush of verification queue failed");
                    }
                }
                Disposition::Deferred
            }
            Err(e) => disposition_for(Err(e)),
        }
    }

    /// Tokens whose records have landed, in original submission order. The
    /// transport acks each exactly once.
    pub fn drain_acks(&self) -> Vec<DeliveryToken> {
        self.store.drain_processed_tokens()
    }

    /// Stops the flush timer and attempts one final flush so shutdown does
    /// not strand buffered records. A failing final flush is logged; the
    /// unflushed messages simply stay unacked and the bus redelivers them.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.flush_thread.take() {
            if handle.join().is_err() {
                error!("Verification flush thread panicked");
            }
        }
        if self.process_batches {
            if let Err(e) = self.store.flush_verification_queue() {
                warn!(error = %e, "Final verification flush failed during shutdown");
            }
        }
    }
}

impl Drop for VerificationConsumer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::db::Database;
    use crate::model::VerifiedFileStatus;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn test_store() -> Arc<ExtractJobStore> {
        let db = Database::open_in_memory().expect("Failed to create test database");
        let clock = FixedClock(Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 0).unwrap());
        Arc::new(ExtractJobStore::new(db, Arc::new(clock)).unwrap())
    }

    fn submitted(job_id: Uuid) -> JobSubmitted {
        JobSubmitted {
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
        }
    }

    fn verified(job_id: Uuid) -> FileVerified {
        FileVerified {
            job_id,
            file_id: Uuid::new_v4(),
            source_path: "a.dcm".to_string(),
            output_path: "a-an.dcm".to_string(),
            verified_status: VerifiedFileStatus::NotIdentifiable,
            report: "[]".to_string(),
        }
    }

    // Long enough that timed flushes never interfere with a test.
    const NO_TIMER: Duration = Duration::from_secs(3600);

    #[test]
    fn test_job_info_consumer_acks_success_and_duplicates() {
        let store = test_store();
        let consumer = JobInfoConsumer::new(Arc::clone(&store));
        let event = submitted(Uuid::new_v4());

        assert!(matches!(consumer.process_message(&event), Disposition::Ack));
        // Second delivery of the same job: duplicate, still acked.
        assert!(matches!(consumer.process_message(&event), Disposition::Ack));
    }

    #[test]
    fn test_malformed_event_is_nacked() {
        let store = test_store();
        let consumer = JobInfoConsumer::new(store);
        let mut event = submitted(Uuid::new_v4());
        event.key_count = 0;

        assert!(matches!(
            consumer.process_message(&event),
            Disposition::Nack
        ));
    }

    #[test]
    fn test_unbatched_verification_acks_immediately() {
        let store = test_store();
        let job_id = Uuid::new_v4();
        JobInfoConsumer::new(Arc::clone(&store)).process_message(&submitted(job_id));

        let consumer = VerificationConsumer::new(Arc::clone(&store), false, 1, NO_TIMER);
        assert!(matches!(
            consumer.process_message(&verified(job_id), 7),
            Disposition::Ack
        ));
        // Nothing was buffered.
        assert_eq!(store.pending_verification_count(), 0);
        assert!(consumer.drain_acks().is_empty());
    }

    #[test]
    fn test_batched_verification_defers_until_threshold() {
        let store = test_store();
        let job_id = Uuid::new_v4();
        JobInfoConsumer::new(Arc::clone(&store)).process_message(&submitted(job_id));

        let consumer = VerificationConsumer::new(Arc::clone(&store), true, 2, NO_TIMER);

        assert!(matches!(
            consumer.process_message(&verified(job_id), 1),
            Disposition::Deferred
        ));
        assert_eq!(store.pending_verification_count(), 1);
        assert!(consumer.drain_acks().is_empty());

        // The second message reaches the threshold and triggers the flush.
        assert!(matches!(
            consumer.process_message(&verified(job_id), 2),
            Disposition::Deferred
        ));
        assert_eq!(store.pending_verification_count(), 0);
        assert_eq!(consumer.drain_acks(), vec![1, 2]);
    }

    #[test]
    fn test_batched_verification_for_terminal_job_is_acked() {
        let store = test_store();
        let job_id = Uuid::new_v4();
        JobInfoConsumer::new(Arc::clone(&store)).process_message(&submitted(job_id));
        store
            .mark_job_failed(job_id, &StoreError::Validation("boom".into()))
            .unwrap();

        let consumer = VerificationConsumer::new(Arc::clone(&store), true, 10, NO_TIMER);
        assert!(matches!(
            consumer.process_message(&verified(job_id), 1),
            Disposition::Ack
        ));
        assert_eq!(store.pending_verification_count(), 0);
    }

    #[test]
    fn test_timed_flush_runs_without_threshold() {
        let store = test_store();
        let job_id = Uuid::new_v4();
        JobInfoConsumer::new(Arc::clone(&store)).process_message(&submitted(job_id));

        let consumer = VerificationConsumer::new(
            Arc::clone(&store),
            true,
            100,
            Duration::from_millis(50),
        );
        consumer.process_message(&verified(job_id), 9);

        // Wait for the timer to elapse, with a bit of wiggle room.
        let mut acks = Vec::new();
        for _ in 0..100 {
            acks = consumer.drain_acks();
            if !acks.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(acks, vec![9]);
    }

    #[test]
    fn test_stop_flushes_remaining_messages() {
        let store = test_store();
        let job_id = Uuid::new_v4();
        JobInfoConsumer::new(Arc::clone(&store)).process_message(&submitted(job_id));

        let mut consumer = VerificationConsumer::new(Arc::clone(&store), true, 100, NO_TIMER);
        consumer.process_message(&verified(job_id), 5);
        assert_eq!(store.pending_verification_count(), 1);

        consumer.stop();
        assert_eq!(store.pending_verification_count(), 0);
        assert_eq!(consumer.drain_acks(), vec![5]);
    }
}
