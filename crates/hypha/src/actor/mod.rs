//! Actor surface: the behavior trait, the per-actor context, and the
//! cloneable handle used as a send target.
//!
//! An actor is a user type implementing [`Actor`] plus a mailbox chosen at
//! construction. Actors sharing a mailbox call each other directly on the
//! stack; actors on different cooperative mailboxes usually do too, via
//! control transfer; crossing into an async mailbox queues.
//!
//! # Example
//!
//! ```rust,ignore
//! use hypha::{Actor, ActorContext, ActorRef, MailboxFactory, Responder};
//!
//! struct Multiplier;
//!
//! impl Actor for Multiplier {
//!     fn process_request(
//!         &mut self,
//!         payload: hypha::Payload,
//!         responder: Responder,
//!         _ctx: &ActorContext,
//!     ) -> Result<(), hypha::BoxError> {
//!         let (a, b) = *payload.downcast::<(i64, i64)>().unwrap();
//!         responder.respond_ok(a * b)
//!     }
//! }
//!
//! let factory = MailboxFactory::new();
//! let multiplier = ActorRef::new(Multiplier, factory.mailbox());
//! let product = multiplier.call(Box::new((3i64, 4i64)))?;
//! assert_eq!(*product.downcast::<i64>().unwrap(), 12);
//! ```

pub(crate) mod context;
pub(crate) mod core;
pub(crate) mod handle;

pub use context::{ActorContext, ActorRef};
pub use handle::Actor;
