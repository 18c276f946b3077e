//! Engine-side state for one actor.
//!
//! The core implements both adapter roles the dispatch engine needs: as a
//! [`RequestSource`] it exposes the owning actor's mailbox and exception
//! handler when the actor originates requests; as a [`RequestProcessor`]
//! it unwraps queued requests and invokes the behavior.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::error;

use crate::dispatch::Responder;
use crate::error::BoxError;
use crate::events::BufferedEventsQueue;
use crate::mailbox::Mailbox;
use crate::message::{
    ExceptionHandler, Message, Payload, Request, RequestProcessor, RequestSource, Response,
};

use super::context::ActorContext;
use super::handle::Actor;

pub(crate) struct ActorCore {
    self_ref: Weak<ActorCore>,
    mailbox: Arc<Mailbox>,
    /// Checked out for the duration of each `process_request` call. A
    /// reentrant dispatch finds the slot empty and takes the queued path
    /// instead of deadlocking.
    behavior: Mutex<Option<Box<dyn Actor>>>,
    exception_handler: Mutex<Option<ExceptionHandler>>,
}

impl ActorCore {
    pub(crate) fn new(behavior: Box<dyn Actor>, mailbox: Arc<Mailbox>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            mailbox,
            behavior: Mutex::new(Some(behavior)),
            exception_handler: Mutex::new(None),
        })
    }

    pub(crate) fn mailbox(&self) -> Arc<Mailbox> {
        self.mailbox.clone()
    }

    pub(crate) fn processor(self: &Arc<Self>) -> Arc<dyn RequestProcessor> {
        self.clone()
    }

    pub(crate) fn handler(&self) -> Option<ExceptionHandler> {
        self.exception_handler.lock().clone()
    }

    pub(crate) fn set_handler(&self, handler: Option<ExceptionHandler>) {
        *self.exception_handler.lock() = handler;
    }

    /// Run the behavior against `payload`. Returns the payload and
    /// responder unconsumed when the behavior is already checked out
    /// (a reentrant dispatch).
    #[allow(clippy::type_complexity)]
    pub(crate) fn try_invoke(
        self: &Arc<Self>,
        payload: Payload,
        responder: Responder,
    ) -> Result<Result<(), BoxError>, (Payload, Responder)> {
        let Some(behavior) = self.behavior.lock().take() else {
            return Err((payload, responder));
        };

        let ctx = ActorContext::new(self.clone());
        let outcome = catch_unwind(AssertUnwindSafe(move || {
            let mut behavior = behavior;
            let result = behavior.process_request(payload, responder, &ctx);
            (behavior, result)
        }));

        match outcome {
            Ok((behavior, result)) => {
                *self.behavior.lock() = Some(behavior);
                Ok(result)
            }
            Err(panic) => {
                // The behavior was lost to the unwind; the actor can no
                // longer process requests.
                error!(mailbox = %self.mailbox.id(), "actor panicked; behavior discarded");
                Ok(Err(panic_to_error(panic)))
            }
        }
    }
}

impl RequestSource for ActorCore {
    fn mailbox(&self) -> Option<Arc<Mailbox>> {
        Some(self.mailbox.clone())
    }

    fn exception_handler(&self) -> Option<ExceptionHandler> {
        self.handler()
    }

    fn set_exception_handler(&self, handler: Option<ExceptionHandler>) {
        self.set_handler(handler);
    }

    fn send(&self, destination: &Arc<Mailbox>, message: Message) {
        self.mailbox.send(destination.clone(), message);
    }

    fn response_from(&self, events: &BufferedEventsQueue, response: Response) {
        events.send(self.mailbox.clone(), Message::Response(response));
    }
}

impl RequestProcessor for ActorCore {
    fn exception_handler(&self) -> Option<ExceptionHandler> {
        self.handler()
    }

    fn process_wrapped(&self, request: &Arc<Request>) -> Result<(), BoxError> {
        let Some(core) = self.self_ref.upgrade() else {
            return Ok(());
        };
        let Some(payload) = request.take_payload() else {
            return Ok(());
        };
        let responder = Responder::queued(core.mailbox.clone(), request.clone());
        match core.try_invoke(payload, responder) {
            Ok(result) => result,
            // Unreachable under the control-token discipline, but a
            // defined failure beats a hung caller.
            Err((_payload, _responder)) => Err(crate::error::DispatchError::ReentrantCall.into()),
        }
    }
}

fn panic_to_error(panic: Box<dyn std::any::Any + Send>) -> BoxError {
    let message = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "actor panicked".to_string()
    };
    message.into()
}
