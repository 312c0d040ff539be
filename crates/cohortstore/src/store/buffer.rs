//! In-memory buffer for verification events.
//!
//! Verification events arrive at much higher volume than any other type
//! (one per extracted file), so they are batched before reaching the status
//! ledger. The buffer only holds data; the flush itself and the
//! all-or-nothing write are driven by the store.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use crate::events::DeliveryToken;
use crate::model::FileStatusRecord;

/// One buffered verification outcome awaiting flush, paired with the bus
/// delivery token to release once it lands.
#[derive(Debug, Clone)]
pub(crate) struct PendingVerification {
    pub record: FileStatusRecord,
    pub token: DeliveryToken,
}

#[derive(Default)]
pub(crate) struct VerificationWriteBuffer {
    /// Pending records in submission order.
    pending: Mutex<Vec<PendingVerification>>,
    /// Tokens released by successful flushes, still in submission order,
    /// awaiting pickup by the consumer.
    processed: Mutex<VecDeque<DeliveryToken>>,
}

impl VerificationWriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: FileStatusRecord, token: DeliveryToken) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PendingVerification { record, token });
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Takes the whole pending queue for a flush attempt.
    pub fn take_pending(&self) -> Vec<PendingVerification> {
        std::mem::take(
            &mut *self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Puts a failed flush batch back, ahead of anything queued since, so
    /// submission order is preserved for the next attempt.
    pub fn restore(&self, mut items: Vec<PendingVerification>) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        items.append(&mut pending);
        *pending = items;
    }

    /// Releases the tokens of a successfully flushed batch, in submission
    /// order.
    pub fn release(&self, items: Vec<PendingVerification>) {
        let mut processed = self
            .processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        processed.extend(items.into_iter().map(|item| item.token));
    }

    /// Drains every released token, oldest first.
    pub fn drain_processed(&self) -> Vec<DeliveryToken> {
        self.processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}
