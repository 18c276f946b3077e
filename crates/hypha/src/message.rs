//! Request/response envelopes and the per-actor adapter traits.
//!
//! Payloads are type-erased: the engine moves `Box<dyn Any + Send>` values
//! between actors and leaves downcasting to the application, the same way
//! an envelope hides its message type behind `Any`. A reply is either a
//! payload or an error; the `Err` arm is how exceptional responses travel
//! on asynchronous paths, where they are routed through the source's
//! exception handler rather than the caller's continuation.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::BoxError;
use crate::events::BufferedEventsQueue;
use crate::mailbox::Mailbox;

/// Type-erased application payload.
pub type Payload = Box<dyn Any + Send>;

/// Outcome of a request: a payload, or the error that answered it.
pub type Reply = Result<Payload, BoxError>;

/// One-shot response handler. Invoked with the eventual reply; may itself
/// fail, in which case the failure is routed by the dispatch engine.
pub type Continuation = Box<dyn FnOnce(Reply) -> Result<(), BoxError> + Send>;

/// Exception handler active for the request being processed.
///
/// Returning `Err` means the handler itself failed; the secondary error is
/// posted as the response of the handler's mailbox.
pub type ExceptionHandler = Arc<dyn Fn(BoxError) -> Result<(), BoxError> + Send + Sync>;

/// Caller-side adapter: lets the dispatch engine reach the originating
/// actor's mailbox and exception-handler slot.
pub trait RequestSource: Send + Sync {
    /// The source's mailbox. External callers have none.
    fn mailbox(&self) -> Option<Arc<Mailbox>>;

    /// The source's currently active exception handler.
    fn exception_handler(&self) -> Option<ExceptionHandler>;

    /// Replace the source's exception handler.
    fn set_exception_handler(&self, handler: Option<ExceptionHandler>);

    /// Route a request to `destination` through the source's outbound
    /// buffer. Nothing is delivered until the buffer is flushed.
    fn send(&self, destination: &Arc<Mailbox>, message: Message);

    /// Route `response` back onto the source's inbound queue via `events`.
    fn response_from(&self, events: &BufferedEventsQueue, response: Response);
}

/// Callee-side adapter: lets the mailbox invoke the target actor's
/// `process_request` polymorphically.
pub trait RequestProcessor: Send + Sync {
    /// The target's currently active exception handler.
    fn exception_handler(&self) -> Option<ExceptionHandler>;

    /// Unwrap a queued request and run the actor's application method.
    fn process_wrapped(&self, request: &Arc<Request>) -> Result<(), BoxError>;
}

/// A queued request: the application payload plus the adapters and
/// continuation needed to process it and route its reply.
pub struct Request {
    source: Arc<dyn RequestSource>,
    processor: Arc<dyn RequestProcessor>,
    payload: Mutex<Option<Payload>>,
    continuation: Mutex<Option<Continuation>>,
    /// True until the first response; later responses are dropped.
    active: AtomicBool,
    /// Request that was current on the source mailbox when this one was
    /// created. Reinstalled while the reply is processed so that chained
    /// responses route to the outer request.
    prior: Option<Arc<Request>>,
}

impl Request {
    pub(crate) fn new(
        source: Arc<dyn RequestSource>,
        processor: Arc<dyn RequestProcessor>,
        payload: Option<Payload>,
        continuation: Continuation,
        prior: Option<Arc<Request>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            processor,
            payload: Mutex::new(payload),
            continuation: Mutex::new(Some(continuation)),
            active: AtomicBool::new(true),
            prior,
        })
    }

    pub(crate) fn source(&self) -> &Arc<dyn RequestSource> {
        &self.source
    }

    pub(crate) fn processor(&self) -> &Arc<dyn RequestProcessor> {
        &self.processor
    }

    pub(crate) fn take_payload(&self) -> Option<Payload> {
        self.payload.lock().take()
    }

    pub(crate) fn take_continuation(&self) -> Option<Continuation> {
        self.continuation.lock().take()
    }

    pub(crate) fn prior(&self) -> Option<Arc<Request>> {
        self.prior.clone()
    }

    /// True when no response has been delivered yet.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Clear the active bit. Returns false when already responded.
    pub(crate) fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    /// Build the response and hand it to the source for routing through
    /// `events` (the responding mailbox's outbound queue).
    pub(crate) fn respond(self: &Arc<Self>, events: &BufferedEventsQueue, reply: Reply) {
        let response = Response {
            request: self.clone(),
            reply,
        };
        self.source.response_from(events, response);
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("active", &self.is_active())
            .field("payload", &"<opaque>")
            .finish()
    }
}

/// A reply travelling back to its request's source mailbox.
pub struct Response {
    pub(crate) request: Arc<Request>,
    pub(crate) reply: Reply,
}

/// A queued mailbox message: requests and responses interleave on the same
/// inbound queue and are processed in arrival order.
pub enum Message {
    Request(Arc<Request>),
    Response(Response),
}
