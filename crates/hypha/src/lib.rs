//! hypha, an adaptive-dispatch actor runtime.
//!
//! Actors exchange requests and replies in local-procedure-call style: a
//! request sent between actors executes **synchronously on the caller's
//! stack whenever safe**, and falls back to buffered queued delivery only
//! when the target belongs to an independent scheduling domain (an async
//! mailbox) or its control token cannot be acquired. Cooperating actors
//! that share a mailbox pay near-direct-call latency; isolation across
//! domain boundaries is preserved.
//!
//! The pieces:
//!
//! - [`Mailbox`]: the unit of serial execution, with an inbound queue, current
//!   request, buffered outbound queue, and a non-blocking control token.
//! - [`MailboxFactory`]: creates cooperative mailboxes and worker-backed
//!   async mailboxes.
//! - [`Actor`] / [`ActorContext`] / [`ActorRef`]: the application surface.
//! - [`Responder`]: the one-shot reply handle, usable immediately or
//!   stored for deferred completion.
//!
//! Replies are `Result`-shaped: the `Err` arm carries application errors,
//! which are routed through exception handlers rather than continuations
//! on asynchronous paths. Errors raised by a caller's *continuation* pass
//! through the callee wrapped in [`TransparentError`], so they can never
//! be swallowed by the callee's handler.
//!
//! Ordering: messages from one mailbox to one destination arrive in send
//! order; there is no ordering across destinations, and no delivery
//! guarantee survives [`MailboxFactory::shutdown`].

pub mod actor;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod factory;
pub mod mailbox;
pub mod message;
pub mod metrics;

pub use actor::{Actor, ActorContext, ActorRef};
pub use config::RuntimeConfig;
pub use dispatch::Responder;
pub use error::{BoxError, DispatchError, TransparentError};
pub use events::BufferedEventsQueue;
pub use factory::MailboxFactory;
pub use mailbox::{Mailbox, MailboxId};
pub use message::{
    Continuation, ExceptionHandler, Message, Payload, Reply, Request, RequestProcessor,
    RequestSource, Response,
};
pub use metrics::MailboxMetrics;
