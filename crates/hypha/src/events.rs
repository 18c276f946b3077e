//! Buffered outbound events.
//!
//! Every mailbox owns one of these queues. Outgoing messages accumulate in
//! per-destination buckets so that many small sends to the same peer cost
//! one handoff when the mailbox flushes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::mailbox::{Mailbox, MailboxId};
use crate::message::Message;

struct Bucket {
    destination: Arc<Mailbox>,
    pending: Vec<Message>,
}

/// Per-mailbox outbound buffer, grouping messages by destination.
///
/// Messages headed for the same destination are delivered in the order
/// they were buffered; there is no ordering across destinations.
pub struct BufferedEventsQueue {
    /// Capacity hint for newly created buckets.
    initial_capacity: AtomicUsize,
    buckets: Mutex<HashMap<MailboxId, Bucket>>,
}

impl BufferedEventsQueue {
    pub(crate) fn new(initial_capacity: usize) -> Self {
        Self {
            initial_capacity: AtomicUsize::new(initial_capacity),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn set_initial_capacity(&self, capacity: usize) {
        self.initial_capacity.store(capacity, Ordering::Relaxed);
    }

    /// Append `message` to the bucket for `destination`.
    pub fn send(&self, destination: Arc<Mailbox>, message: Message) {
        let key = destination.id();
        let capacity = self.initial_capacity.load(Ordering::Relaxed);
        self.buckets
            .lock()
            .entry(key)
            .or_insert_with(|| Bucket {
                destination,
                pending: Vec::with_capacity(capacity),
            })
            .pending
            .push(message);
    }

    /// Deliver each bucket to its destination's inbound queue and clear it.
    ///
    /// `controller` is the flushing mailbox's controlling identity; a
    /// cooperative destination is driven under it when free. Flushing an
    /// empty queue is a no-op. Returns the number of messages delivered.
    pub fn dispatch_events(&self, controller: MailboxId) -> usize {
        let drained: Vec<Bucket> = {
            let mut buckets = self.buckets.lock();
            if buckets.is_empty() {
                return 0;
            }
            buckets.drain().map(|(_, bucket)| bucket).collect()
        };

        let mut delivered = 0;
        for bucket in drained {
            delivered += bucket.pending.len();
            bucket.destination.deliver(bucket.pending, controller);
        }
        delivered
    }

    /// Messages currently buffered across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.lock().values().map(|b| b.pending.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::factory::MailboxFactory;
    use crate::message::{
        ExceptionHandler, Request, RequestProcessor, RequestSource, Response,
    };
    use std::sync::Arc;

    /// Processor that records the usize payload of every request it sees.
    struct Recorder {
        seen: Mutex<Vec<usize>>,
    }

    impl RequestProcessor for Recorder {
        fn exception_handler(&self) -> Option<ExceptionHandler> {
            None
        }

        fn process_wrapped(&self, request: &Arc<Request>) -> Result<(), BoxError> {
            let payload = request.take_payload().expect("payload");
            let value = *payload.downcast::<usize>().expect("usize payload");
            self.seen.lock().push(value);
            Ok(())
        }
    }

    struct NullSource;

    impl RequestSource for NullSource {
        fn mailbox(&self) -> Option<Arc<Mailbox>> {
            None
        }
        fn exception_handler(&self) -> Option<ExceptionHandler> {
            None
        }
        fn set_exception_handler(&self, _handler: Option<ExceptionHandler>) {}
        fn send(&self, destination: &Arc<Mailbox>, message: Message) {
            destination.deliver(vec![message], MailboxId(u64::MAX));
        }
        fn response_from(&self, _events: &BufferedEventsQueue, _response: Response) {}
    }

    fn request_for(recorder: &Arc<Recorder>, value: usize) -> Arc<Request> {
        Request::new(
            Arc::new(NullSource),
            recorder.clone(),
            Some(Box::new(value)),
            Box::new(|_| Ok(())),
            None,
        )
    }

    #[test]
    fn test_flush_preserves_per_destination_order() {
        let factory = MailboxFactory::new();
        let destination = factory.mailbox();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });

        let queue = BufferedEventsQueue::new(4);
        for value in 0..5 {
            queue.send(
                destination.clone(),
                Message::Request(request_for(&recorder, value)),
            );
        }
        assert_eq!(queue.len(), 5);

        let delivered = queue.dispatch_events(MailboxId(u64::MAX - 1));
        assert_eq!(delivered, 5);
        assert!(queue.is_empty());
        assert_eq!(*recorder.seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_flush_of_empty_queue_is_idempotent() {
        let queue = BufferedEventsQueue::new(4);
        assert_eq!(queue.dispatch_events(MailboxId(u64::MAX - 1)), 0);
        assert_eq!(queue.dispatch_events(MailboxId(u64::MAX - 1)), 0);
    }

    #[test]
    fn test_buckets_are_cleared_by_flush() {
        let factory = MailboxFactory::new();
        let destination = factory.mailbox();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });

        let queue = BufferedEventsQueue::new(1);
        queue.send(
            destination.clone(),
            Message::Request(request_for(&recorder, 7)),
        );
        queue.dispatch_events(MailboxId(u64::MAX - 1));

        // A second flush must not redeliver.
        assert_eq!(queue.dispatch_events(MailboxId(u64::MAX - 1)), 0);
        assert_eq!(*recorder.seen.lock(), vec![7]);
    }
}
