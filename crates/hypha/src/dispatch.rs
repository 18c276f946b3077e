//! The request dispatch engine.
//!
//! `accept_request` decides, per request, between four delivery paths:
//!
//! 1. caller and target share a mailbox: run on the caller's stack;
//! 2. the target is async (or the caller has no mailbox): queue;
//! 3. caller and target already share a controlling mailbox: run on the
//!    caller's stack;
//! 4. the target's control token can be acquired: run on the caller's
//!    stack, then flush, hand the token back, and dispatch whatever
//!    queued up during the loan;
//! 5. otherwise: queue.
//!
//! The caller's exception handler is captured before dispatch and restored
//! on every completion path. Errors raised by the caller's continuation
//! travel back through the callee wrapped in [`TransparentError`] so the
//! callee's handler never consumes them.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::actor::core::ActorCore;
use crate::error::{BoxError, TransparentError};
use crate::mailbox::{Mailbox, MailboxId};
use crate::message::{
    Continuation, ExceptionHandler, Message, Payload, Reply, Request, RequestProcessor,
    RequestSource,
};

/// One-shot handle for answering a request, passed to
/// [`Actor::process_request`](crate::Actor::process_request).
///
/// The handle is owned and `Send`: an actor that cannot answer yet may
/// store it and respond later from any context. At most one response is
/// delivered; later calls are silently dropped.
pub struct Responder {
    inner: ResponderInner,
}

enum ResponderInner {
    /// Queued dispatch: route through the mailbox response plumbing.
    Queued {
        mailbox: Arc<Mailbox>,
        request: Arc<Request>,
    },
    /// Same-mailbox synchronous dispatch: forward straight to the caller's
    /// continuation.
    Inline {
        continuation: Mutex<Option<Continuation>>,
    },
    /// Cross-mailbox cooperative dispatch.
    Extended(Arc<ExtendedResponseProcessor>),
}

impl Responder {
    pub(crate) fn queued(mailbox: Arc<Mailbox>, request: Arc<Request>) -> Self {
        Self {
            inner: ResponderInner::Queued { mailbox, request },
        }
    }

    pub(crate) fn inline(continuation: Continuation) -> Self {
        Self {
            inner: ResponderInner::Inline {
                continuation: Mutex::new(Some(continuation)),
            },
        }
    }

    fn extended(erp: Arc<ExtendedResponseProcessor>) -> Self {
        Self {
            inner: ResponderInner::Extended(erp),
        }
    }

    /// Deliver the reply.
    ///
    /// On synchronous paths this runs the caller's continuation on the
    /// current stack; a failure raised by that continuation is returned
    /// wrapped so it propagates through the callee untouched (propagate it
    /// with `?`).
    pub fn respond(&self, reply: Reply) -> Result<(), BoxError> {
        match &self.inner {
            ResponderInner::Queued { mailbox, request } => {
                mailbox.respond_to(request, reply);
                Ok(())
            }
            ResponderInner::Inline { continuation } => {
                let Some(continuation) = continuation.lock().take() else {
                    return Ok(());
                };
                continuation(reply).map_err(TransparentError::wrap)
            }
            ResponderInner::Extended(erp) => erp.process(reply),
        }
    }

    /// Respond with a value.
    pub fn respond_ok<T: Any + Send>(&self, value: T) -> Result<(), BoxError> {
        self.respond(Ok(Box::new(value)))
    }

    /// Respond with an error; it reaches the caller through the exception
    /// route, not the continuation.
    pub fn respond_err(&self, error: impl Into<BoxError>) -> Result<(), BoxError> {
        self.respond(Err(error.into()))
    }

    /// Recover the raw caller continuation, abandoning this handle.
    pub(crate) fn into_continuation(self) -> Option<Continuation> {
        match self.inner {
            ResponderInner::Queued { request, .. } => request.take_continuation(),
            ResponderInner::Inline { continuation } => continuation.into_inner(),
            ResponderInner::Extended(erp) => erp.continuation.lock().take(),
        }
    }
}

/// Continuation state for a cross-mailbox cooperative send.
///
/// The flag pair records whether the continuation fired re-entrantly
/// inside `process_request` (`sync`) or only after it returned
/// (`deferred`). That answers "did the callee respond before returning
/// control?", which decides between delivery by stack return and delivery
/// through the mailbox scheduler.
pub(crate) struct ExtendedResponseProcessor {
    sync: AtomicBool,
    deferred: AtomicBool,
    continuation: Mutex<Option<Continuation>>,
    source: Arc<dyn RequestSource>,
    source_mailbox: Arc<Mailbox>,
    target_mailbox: Arc<Mailbox>,
    target_processor: Arc<dyn RequestProcessor>,
    /// The caller's handler as captured at dispatch (EHS).
    handler: Option<ExceptionHandler>,
    /// Request current on the source mailbox at dispatch.
    prior: Option<Arc<Request>>,
}

impl ExtendedResponseProcessor {
    fn process(&self, reply: Reply) -> Result<(), BoxError> {
        self.source.set_exception_handler(self.handler.clone());

        if !self.deferred.load(Ordering::Acquire) {
            // Still inside process_request: complete by stack return.
            self.sync.store(true, Ordering::Release);
            let Some(continuation) = self.continuation.lock().take() else {
                return Ok(());
            };
            continuation(reply).map_err(TransparentError::wrap)
        } else {
            match reply {
                Err(e) => {
                    async_exception(e, self.handler.as_ref(), Some(&self.source_mailbox));
                    Ok(())
                }
                Ok(value) => {
                    self.deferred_response(Ok(value));
                    Ok(())
                }
            }
        }
    }

    /// The callee completed after returning control; decide from the
    /// current control tokens whether the continuation may still run
    /// inline or must be rescheduled.
    fn deferred_response(&self, reply: Reply) {
        let source_controller = self.source_mailbox.controlling();
        let target_controller = self.target_mailbox.controlling();

        if source_controller == target_controller {
            if let Err(e) = self.invoke_continuation(reply) {
                async_exception(e, self.handler.as_ref(), Some(&self.source_mailbox));
            }
        } else if self.source_mailbox.is_async()
            || !self.target_mailbox.acquire_control(source_controller)
        {
            self.async_response(reply);
        } else {
            let result = {
                let _guard = ControlGuard::new(&self.target_mailbox, source_controller);
                self.invoke_continuation(reply)
            };
            if let Err(e) = result {
                async_exception(e, self.handler.as_ref(), Some(&self.source_mailbox));
            }
        }
    }

    fn invoke_continuation(&self, reply: Reply) -> Result<(), BoxError> {
        match self.continuation.lock().take() {
            None => Ok(()),
            Some(continuation) => continuation(reply),
        }
    }

    /// Rebuild a request carrying the caller's continuation, install it as
    /// the target's current request, and push the reply through the normal
    /// response plumbing.
    fn async_response(&self, reply: Reply) {
        let Some(continuation) = self.continuation.lock().take() else {
            return;
        };
        let request = Request::new(
            self.source.clone(),
            self.target_processor.clone(),
            None,
            continuation,
            self.prior.clone(),
        );
        self.target_mailbox.set_current_request(request);
        self.target_mailbox.response(reply);
    }
}

/// Runs the mandatory cleanup when a control loan ends, on every exit path
/// including errors and panics: flush pending outbound, hand the token
/// back, then dispatch messages that accumulated during the loan. The
/// order is fixed.
struct ControlGuard<'a> {
    mailbox: &'a Mailbox,
    original: MailboxId,
}

impl<'a> ControlGuard<'a> {
    fn new(mailbox: &'a Mailbox, original: MailboxId) -> Self {
        Self { mailbox, original }
    }
}

impl Drop for ControlGuard<'_> {
    fn drop(&mut self) {
        self.mailbox.send_pending_messages();
        self.mailbox.relinquish_control();
        self.mailbox.dispatch_remaining(self.original);
    }
}

/// Route an error that completes a request asynchronously: hand it to the
/// captured handler if there is one, otherwise post it as the response of
/// the source mailbox so it propagates up the chain. A failing handler's
/// secondary error is posted the same way.
fn async_exception(
    error: BoxError,
    handler: Option<&ExceptionHandler>,
    source_mailbox: Option<&Arc<Mailbox>>,
) {
    let post = |error: BoxError| match source_mailbox {
        Some(mailbox) => mailbox.response(Err(error)),
        None => tracing::error!(error = %error, "actor error with no route to a source mailbox"),
    };
    match handler {
        None => post(error),
        Some(handler) => {
            if let Err(secondary) = handler(error) {
                post(secondary);
            }
        }
    }
}

/// The dispatch decision tree.
pub(crate) fn accept_request(
    target: &Arc<ActorCore>,
    source: Arc<dyn RequestSource>,
    payload: Payload,
    continuation: Continuation,
) -> Result<(), BoxError> {
    let target_mailbox = target.mailbox();
    let source_mailbox = source.mailbox();
    // EHS: restored on every completion path.
    let handler = source.exception_handler();

    match source_mailbox {
        Some(ref ms) if Arc::ptr_eq(ms, &target_mailbox) => {
            trace!(mailbox = %target_mailbox.id(), "dispatch: shared mailbox, sync process");
            sync_process(target, source, payload, continuation, handler)
        }
        Some(ms) if !target_mailbox.is_async() => {
            let source_controller = ms.controlling();
            if target_mailbox.controlling() == source_controller {
                trace!(mailbox = %target_mailbox.id(), "dispatch: shared controller, sync send");
                return sync_send(target, source, ms, payload, continuation, handler);
            }
            if !target_mailbox.acquire_control(source_controller) {
                trace!(mailbox = %target_mailbox.id(), "dispatch: control contended, async send");
                return async_send(target, source, payload, continuation, handler);
            }
            trace!(mailbox = %target_mailbox.id(), "dispatch: control acquired, sync send");
            let _guard = ControlGuard::new(&target_mailbox, source_controller);
            sync_send(target, source, ms, payload, continuation, handler)
        }
        _ => {
            trace!(mailbox = %target_mailbox.id(), "dispatch: async send");
            async_send(target, source, payload, continuation, handler)
        }
    }
}

/// Path 1: caller and target share a mailbox. The target runs on the
/// caller's stack; its responder forwards straight to the caller's
/// continuation.
fn sync_process(
    target: &Arc<ActorCore>,
    source: Arc<dyn RequestSource>,
    payload: Payload,
    continuation: Continuation,
    handler: Option<ExceptionHandler>,
) -> Result<(), BoxError> {
    let responder = Responder::inline(continuation);
    let result = match target.try_invoke(payload, responder) {
        Ok(result) => result,
        Err((payload, responder)) => {
            // The target is already mid-request on this stack; queue the
            // request instead of deadlocking on its state.
            let Some(continuation) = responder.into_continuation() else {
                return Ok(());
            };
            return async_send(target, source, payload, continuation, handler);
        }
    };

    match result {
        Ok(()) => {
            source.set_exception_handler(handler);
            Ok(())
        }
        Err(e) => match e.downcast::<TransparentError>() {
            Ok(transparent) => {
                // The caller's own continuation failed; bypass handlers.
                source.set_exception_handler(handler);
                Err(transparent.into_inner())
            }
            Err(e) => {
                source.set_exception_handler(handler.clone());
                match handler {
                    None => Err(e),
                    Some(handler) => handler(e),
                }
            }
        },
    }
}

/// Paths 2 and 5: wrap the continuation with handler restore and async
/// exception routing, then queue through the source's outbound buffer.
/// Delivery is eventual.
fn async_send(
    target: &Arc<ActorCore>,
    source: Arc<dyn RequestSource>,
    payload: Payload,
    continuation: Continuation,
    handler: Option<ExceptionHandler>,
) -> Result<(), BoxError> {
    let target_mailbox = target.mailbox();
    let prior = source.mailbox().and_then(|m| m.current_request());

    let wrapped_source = source.clone();
    let wrapped: Continuation = Box::new(move |reply: Reply| {
        wrapped_source.set_exception_handler(handler.clone());
        match reply {
            Err(e) => match wrapped_source.mailbox() {
                Some(ms) => async_exception(e, handler.as_ref(), Some(&ms)),
                // A caller with no mailbox has no exception route; the
                // continuation is the only sink.
                None => {
                    let _ = continuation(Err(e));
                }
            },
            Ok(value) => {
                if let Err(e) = continuation(Ok(value)) {
                    let ms = wrapped_source.mailbox();
                    async_exception(e, handler.as_ref(), ms.as_ref());
                }
            }
        }
        Ok(())
    });

    let request = Request::new(source.clone(), target.processor(), Some(payload), wrapped, prior);
    source.send(&target_mailbox, Message::Request(request));
    Ok(())
}

/// Paths 3 and 4: cross-mailbox but cooperative. The target runs on the
/// caller's stack with an extended response processor deciding, at
/// completion time, between stack return and rescheduling.
fn sync_send(
    target: &Arc<ActorCore>,
    source: Arc<dyn RequestSource>,
    source_mailbox: Arc<Mailbox>,
    payload: Payload,
    continuation: Continuation,
    handler: Option<ExceptionHandler>,
) -> Result<(), BoxError> {
    let erp = Arc::new(ExtendedResponseProcessor {
        sync: AtomicBool::new(false),
        deferred: AtomicBool::new(false),
        continuation: Mutex::new(Some(continuation)),
        source: source.clone(),
        prior: source_mailbox.current_request(),
        source_mailbox,
        target_mailbox: target.mailbox(),
        target_processor: target.processor(),
        handler: handler.clone(),
    });

    let result = match target.try_invoke(payload, Responder::extended(erp.clone())) {
        Ok(result) => result,
        Err((payload, responder)) => {
            let Some(continuation) = responder.into_continuation() else {
                return Ok(());
            };
            return async_send(target, source, payload, continuation, handler);
        }
    };

    match result {
        Ok(()) => {
            if !erp.sync.load(Ordering::Acquire) {
                // No response yet: it will arrive after control returns.
                erp.deferred.store(true, Ordering::Release);
            }
            Ok(())
        }
        Err(e) => match e.downcast::<TransparentError>() {
            // The caller's continuation failed; the handler restore
            // already happened when the continuation fired.
            Ok(transparent) => Err(transparent.into_inner()),
            Err(e) => match target.handler() {
                None => Err(e),
                Some(handler) => handler(e),
            },
        },
    }
}
