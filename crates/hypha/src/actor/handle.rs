//! The actor behavior trait.

use crate::dispatch::Responder;
use crate::error::BoxError;
use crate::message::Payload;

use super::context::ActorContext;

/// Application behavior of an actor.
///
/// `process_request` is invoked once per request, either on the caller's
/// stack (synchronous paths) or from the mailbox's dispatch cycle (queued
/// paths); the behavior cannot tell and should not care. Answer through
/// `responder`, immediately or later; returning `Err` raises an
/// application error, which goes to this actor's exception handler if one
/// is installed and otherwise surfaces to the caller.
pub trait Actor: Send + 'static {
    fn process_request(
        &mut self,
        payload: Payload,
        responder: Responder,
        ctx: &ActorContext,
    ) -> Result<(), BoxError>;
}
