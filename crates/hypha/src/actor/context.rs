//! Actor context and reference types.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::error;

use crate::dispatch;
use crate::error::{BoxError, DispatchError};
use crate::events::BufferedEventsQueue;
use crate::factory::MailboxFactory;
use crate::mailbox::{Mailbox, MailboxId};
use crate::message::{
    Continuation, ExceptionHandler, Message, Payload, Reply, RequestSource, Response,
};

use super::core::ActorCore;
use super::handle::Actor;

/// Context handed to [`Actor::process_request`].
///
/// Cloneable so continuations can capture it and keep sending after the
/// current request completes.
#[derive(Clone)]
pub struct ActorContext {
    core: Arc<ActorCore>,
}

impl ActorContext {
    pub(crate) fn new(core: Arc<ActorCore>) -> Self {
        Self { core }
    }

    /// Send `payload` to `target`, with `continuation` receiving the
    /// eventual reply.
    ///
    /// The request runs on this stack whenever the target's mailbox can be
    /// entered safely; otherwise it is buffered on this actor's outbound
    /// queue and delivered at the next flush. Call this only from the
    /// actor's processing context (including its continuations), since
    /// messages are flushed by the mailbox's dispatch cycle.
    pub fn send<F>(&self, target: &ActorRef, payload: Payload, continuation: F) -> Result<(), BoxError>
    where
        F: FnOnce(Reply) -> Result<(), BoxError> + Send + 'static,
    {
        dispatch::accept_request(
            &target.core,
            self.core.clone(),
            payload,
            Box::new(continuation),
        )
    }

    /// Install an exception handler for the request being processed.
    ///
    /// Handlers set during a call do not leak to the caller: the engine
    /// restores the caller's handler on every completion path.
    pub fn set_exception_handler<F>(&self, handler: F)
    where
        F: Fn(BoxError) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.core.set_handler(Some(Arc::new(handler)));
    }

    /// Remove the active exception handler.
    pub fn clear_exception_handler(&self) {
        self.core.set_handler(None);
    }

    /// The currently active exception handler.
    pub fn exception_handler(&self) -> Option<ExceptionHandler> {
        self.core.handler()
    }

    /// This actor's mailbox.
    pub fn mailbox(&self) -> Arc<Mailbox> {
        self.core.mailbox()
    }

    /// The factory that created this actor's mailbox.
    pub fn mailbox_factory(&self) -> MailboxFactory {
        self.core.mailbox().factory()
    }

    /// Size hint for this mailbox's outbound buckets.
    pub fn set_initial_buffer_capacity(&self, capacity: usize) {
        self.core.mailbox().set_initial_buffer_capacity(capacity);
    }

    /// A sendable handle to this actor.
    pub fn actor_ref(&self) -> ActorRef {
        ActorRef {
            core: self.core.clone(),
        }
    }
}

/// Cloneable handle to an actor: the target of sends and the entry point
/// for callers outside the actor system.
#[derive(Clone)]
pub struct ActorRef {
    pub(crate) core: Arc<ActorCore>,
}

impl ActorRef {
    /// Create an actor from its behavior and mailbox. The mailbox may be
    /// shared with other actors.
    pub fn new(behavior: impl Actor, mailbox: Arc<Mailbox>) -> Self {
        Self {
            core: ActorCore::new(Box::new(behavior), mailbox),
        }
    }

    /// This actor's mailbox.
    pub fn mailbox(&self) -> Arc<Mailbox> {
        self.core.mailbox()
    }

    /// Send from outside the actor system and block until the reply
    /// arrives.
    ///
    /// A caller without a mailbox always takes the queued path; for a
    /// cooperative target the request is still driven promptly on this
    /// thread when the target's control token is free.
    pub fn call(&self, payload: Payload) -> Result<Payload, BoxError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.start_call(payload, reply_tx)?;
        match reply_rx.recv() {
            Ok(reply) => reply,
            Err(_) => Err(DispatchError::CallDropped.into()),
        }
    }

    /// [`ActorRef::call`] with an upper bound on the wait.
    pub fn call_timeout(&self, payload: Payload, timeout: Duration) -> Result<Payload, BoxError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.start_call(payload, reply_tx)?;
        match reply_rx.recv_timeout(timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => Err(DispatchError::CallTimeout(timeout).into()),
            Err(RecvTimeoutError::Disconnected) => Err(DispatchError::CallDropped.into()),
        }
    }

    fn start_call(&self, payload: Payload, reply_tx: Sender<Reply>) -> Result<(), BoxError> {
        let source = Arc::new(ExternalSource {
            control: self.core.mailbox().factory().next_id(),
        });
        let continuation: Continuation = Box::new(move |reply| {
            let _ = reply_tx.send(reply);
            Ok(())
        });
        dispatch::accept_request(&self.core, source, payload, continuation)
    }
}

impl fmt::Debug for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRef")
            .field("mailbox", &self.core.mailbox().id())
            .finish()
    }
}

/// Request source for callers that have no mailbox. Requests from it
/// always select the queued path; replies complete on the spot instead of
/// routing through an inbound queue.
struct ExternalSource {
    /// Fresh control identity, so driving a free cooperative target from
    /// the calling thread follows the normal token discipline.
    control: MailboxId,
}

impl RequestSource for ExternalSource {
    fn mailbox(&self) -> Option<Arc<Mailbox>> {
        None
    }

    fn exception_handler(&self) -> Option<ExceptionHandler> {
        None
    }

    fn set_exception_handler(&self, _handler: Option<ExceptionHandler>) {}

    fn send(&self, destination: &Arc<Mailbox>, message: Message) {
        destination.deliver(vec![message], self.control);
    }

    fn response_from(&self, _events: &BufferedEventsQueue, response: Response) {
        let Response { request, reply } = response;
        if let Some(continuation) = request.take_continuation() {
            if let Err(e) = continuation(reply) {
                error!(error = %e, "external call continuation failed");
            }
        }
    }
}
