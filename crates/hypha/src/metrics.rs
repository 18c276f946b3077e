//! Per-mailbox counters for monitoring and tests.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by each mailbox.
///
/// All counters are relaxed atomics; they are observability aids, not
/// synchronization points.
#[derive(Debug, Default)]
pub struct MailboxMetrics {
    /// Messages accepted onto the inbound queue.
    queued: AtomicU64,

    /// Messages taken off the inbound queue and dispatched.
    processed: AtomicU64,

    /// Outbound flushes that delivered at least one message.
    flush_batches: AtomicU64,

    /// Messages delivered by outbound flushes.
    flushed_messages: AtomicU64,

    /// Responses dropped because their request had already been answered.
    duplicate_responses: AtomicU64,
}

impl MailboxMetrics {
    pub(crate) fn record_queued(&self, count: usize) {
        self.queued.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self, delivered: usize) {
        self.flush_batches.fetch_add(1, Ordering::Relaxed);
        self.flushed_messages
            .fetch_add(delivered as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate_response(&self) {
        self.duplicate_responses.fetch_add(1, Ordering::Relaxed);
    }

    /// Messages accepted onto the inbound queue.
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    /// Messages dispatched from the inbound queue.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Number of non-empty outbound flushes.
    pub fn flush_batches(&self) -> u64 {
        self.flush_batches.load(Ordering::Relaxed)
    }

    /// Messages delivered by outbound flushes.
    pub fn flushed_messages(&self) -> u64 {
        self.flushed_messages.load(Ordering::Relaxed)
    }

    /// Responses silently dropped by the one-response rule.
    pub fn duplicate_responses(&self) -> u64 {
        self.duplicate_responses.load(Ordering::Relaxed)
    }
}
