//! Mailboxes: the unit of serial execution.
//!
//! A mailbox owns an inbound queue of messages, the request currently
//! being serviced, an outbound [`BufferedEventsQueue`], and a control
//! token. The token names which mailbox currently holds execution rights
//! here; it equals the mailbox's own id when free. Cross-mailbox
//! synchronous dispatch works by acquiring the token (a non-blocking CAS),
//! running on the caller's stack, and handing the token back; the engine
//! never waits on it.
//!
//! An async mailbox is bound to a worker thread and crossing into it
//! always queues. A cooperative mailbox executes on whichever thread holds
//! its token.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{error, trace, warn};

use crate::error::TransparentError;
use crate::events::BufferedEventsQueue;
use crate::factory::MailboxFactory;
use crate::message::{Message, Reply, Request, Response};
use crate::metrics::MailboxMetrics;

/// Identity of a mailbox, used as the control-token value.
///
/// External callers are issued fresh ids from the same sequence so their
/// control identity never collides with a real mailbox.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MailboxId(pub(crate) u64);

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mailbox-{}", self.0)
    }
}

/// Serial execution context for one or more actors.
pub struct Mailbox {
    id: MailboxId,
    asynchronous: bool,
    /// Control token: the id of the mailbox that owns execution rights
    /// here. Equal to `self.id` when free.
    controller: AtomicU64,
    inbound: Mutex<VecDeque<Message>>,
    current: Mutex<Option<Arc<Request>>>,
    outbound: BufferedEventsQueue,
    factory: MailboxFactory,
    /// Wake signal for the worker thread; None for cooperative mailboxes.
    wake: Mutex<Option<Sender<()>>>,
    metrics: MailboxMetrics,
}

impl Mailbox {
    pub(crate) fn new(
        id: MailboxId,
        asynchronous: bool,
        factory: MailboxFactory,
        initial_buffer_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            asynchronous,
            controller: AtomicU64::new(id.0),
            inbound: Mutex::new(VecDeque::new()),
            current: Mutex::new(None),
            outbound: BufferedEventsQueue::new(initial_buffer_capacity),
            factory,
            wake: Mutex::new(None),
            metrics: MailboxMetrics::default(),
        })
    }

    pub(crate) fn bind_worker(&self, wake: Sender<()>) {
        *self.wake.lock() = Some(wake);
    }

    /// Drop the worker wake channel; the worker exits once it notices.
    pub(crate) fn close(&self) {
        self.wake.lock().take();
    }

    pub fn id(&self) -> MailboxId {
        self.id
    }

    /// True when this mailbox is backed by its own worker thread.
    pub fn is_async(&self) -> bool {
        self.asynchronous
    }

    /// The factory this mailbox was created by.
    pub fn factory(&self) -> MailboxFactory {
        self.factory.clone()
    }

    pub fn metrics(&self) -> &MailboxMetrics {
        &self.metrics
    }

    /// Current control-token identity. Equals [`Mailbox::id`] when free.
    pub fn controlling(&self) -> MailboxId {
        MailboxId(self.controller.load(Ordering::Acquire))
    }

    /// Non-blocking test-and-set on the control token.
    ///
    /// Succeeds only when the mailbox is free. In particular a reentrant
    /// acquisition (the token already names `candidate`) fails; callers
    /// fall back to queued delivery instead of blocking.
    pub fn acquire_control(&self, candidate: MailboxId) -> bool {
        self.controller
            .compare_exchange(self.id.0, candidate.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Reset the control token to self.
    pub fn relinquish_control(&self) {
        self.controller.store(self.id.0, Ordering::Release);
    }

    /// Size hint passed to newly created outbound buckets.
    pub fn set_initial_buffer_capacity(&self, capacity: usize) {
        self.outbound.set_initial_capacity(capacity);
    }

    /// Messages currently buffered in outbound buckets.
    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// Buffer `message` for `destination`. Nothing is delivered until a
    /// flush.
    pub fn send(&self, destination: Arc<Mailbox>, message: Message) {
        self.outbound.send(destination, message);
    }

    /// Install `request` so that a subsequent [`Mailbox::response`] knows
    /// where to route.
    pub fn set_current_request(&self, request: Arc<Request>) {
        *self.current.lock() = Some(request);
    }

    pub(crate) fn current_request(&self) -> Option<Arc<Request>> {
        self.current.lock().clone()
    }

    /// Respond to the current request.
    ///
    /// The request's active bit enforces the one-response rule: a request
    /// that has already been answered drops later replies silently.
    pub fn response(&self, reply: Reply) {
        let Some(request) = self.current_request() else {
            match reply {
                Err(e) => error!(mailbox = %self.id, error = %e, "actor error with no pending request"),
                Ok(_) => warn!(mailbox = %self.id, "response with no pending request dropped"),
            }
            return;
        };
        if !request.deactivate() {
            trace!(mailbox = %self.id, "duplicate response dropped");
            self.metrics.record_duplicate_response();
            return;
        }
        request.respond(&self.outbound, reply);
    }

    /// Respond to a specific request. Safe for deferred completion: the
    /// request is reinstalled as current before routing.
    pub fn respond_to(&self, request: &Arc<Request>, reply: Reply) {
        self.set_current_request(request.clone());
        self.response(reply);
    }

    /// Flush outbound buckets to their destinations.
    ///
    /// Buckets are emptied only by their owning mailbox, and only while it
    /// holds control.
    pub fn send_pending_messages(&self) {
        let delivered = self.outbound.dispatch_events(self.controlling());
        if delivered > 0 {
            self.metrics.record_flush(delivered);
        }
    }

    /// Accept a batch onto the inbound queue and trigger dispatch:
    /// wake the worker for an async mailbox, or drive a cooperative one
    /// under the deliverer's controlling identity.
    pub(crate) fn deliver(&self, batch: Vec<Message>, controller: MailboxId) {
        if batch.is_empty() {
            return;
        }
        self.metrics.record_queued(batch.len());
        self.inbound.lock().extend(batch);
        if self.asynchronous {
            self.wake_worker();
        } else {
            self.dispatch_remaining(controller);
        }
    }

    fn wake_worker(&self) {
        if let Some(wake) = self.wake.lock().as_ref() {
            // Full just means a wakeup is already pending.
            let _ = wake.try_send(());
        }
    }

    /// Process inbound messages that accumulated here, driving the mailbox
    /// as `original` while it can be acquired.
    ///
    /// This is both the post-loan cleanup step of a cross-mailbox
    /// synchronous call and the way a delivery drives a free cooperative
    /// mailbox. On return either the inbound queue is empty or another
    /// controller owns the mailbox and will drain it when it hands the
    /// token back.
    pub fn dispatch_remaining(&self, original: MailboxId) {
        loop {
            if self.inbound.lock().is_empty() {
                return;
            }
            if !self.acquire_control(original) {
                return;
            }
            self.drain_inbound();
            self.send_pending_messages();
            self.relinquish_control();
        }
    }

    /// Pop and process inbound messages until the queue is empty. The
    /// caller must hold control (or be the mailbox's worker).
    pub(crate) fn drain_inbound(&self) {
        loop {
            let message = self.inbound.lock().pop_front();
            match message {
                None => return,
                Some(message) => self.process_message(message),
            }
        }
    }

    fn process_message(&self, message: Message) {
        match message {
            Message::Request(request) => self.process_queued_request(request),
            Message::Response(response) => self.process_queued_response(response),
        }
        self.metrics.record_processed();
    }

    fn process_queued_request(&self, request: Arc<Request>) {
        let previous = self.current.lock().replace(request.clone());

        if let Err(e) = request.processor().process_wrapped(&request) {
            // Transparent wrappers are unwrapped at the first catcher; the
            // inner error belongs to the caller's continuation and is not
            // eligible for the callee's handler, but by the time an error
            // reaches the queue boundary the sync paths have already
            // unwrapped theirs, so anything left is treated as the
            // callee's own failure.
            let e = match e.downcast::<TransparentError>() {
                Ok(transparent) => transparent.into_inner(),
                Err(e) => e,
            };
            match request.processor().exception_handler() {
                Some(handler) => {
                    if let Err(secondary) = handler(e) {
                        self.response(Err(secondary));
                    }
                }
                None => self.response(Err(e)),
            }
        }

        *self.current.lock() = previous;
    }

    fn process_queued_response(&self, response: Response) {
        let Response { request, reply } = response;

        // Reinstall the request that was current when this exchange began,
        // so responses the continuation produces route to the outer
        // request.
        let previous = {
            let mut current = self.current.lock();
            std::mem::replace(&mut *current, request.prior())
        };

        match request.take_continuation() {
            None => {
                trace!(mailbox = %self.id, "response for an already-completed request dropped");
                self.metrics.record_duplicate_response();
            }
            Some(continuation) => {
                if let Err(e) = continuation(reply) {
                    // A failing continuation completes asynchronously:
                    // offer the error to the source's handler, otherwise
                    // post it as the response of the outer request.
                    let e = match e.downcast::<TransparentError>() {
                        Ok(transparent) => transparent.into_inner(),
                        Err(e) => e,
                    };
                    match request.source().exception_handler() {
                        Some(handler) => {
                            if let Err(secondary) = handler(e) {
                                self.response(Err(secondary));
                            }
                        }
                        None => self.response(Err(e)),
                    }
                }
            }
        }

        *self.current.lock() = previous;
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("id", &self.id)
            .field("async", &self.asynchronous)
            .field("controlling", &self.controlling())
            .finish()
    }
}
