use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Boxed error type carried through the dispatch engine.
///
/// Actors raise application errors by returning `Err` from
/// `process_request`; the engine routes them to exception handlers or back
/// to the caller as the `Err` arm of a [`Reply`](crate::Reply).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the dispatch engine itself.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The request was dropped without ever being responded to.
    #[error("call abandoned without a response")]
    CallDropped,

    /// A blocking call did not complete in time.
    #[error("call timed out after {0:?}")]
    CallTimeout(Duration),

    /// A queued request reached an actor whose behavior was already
    /// checked out on the same call stack.
    #[error("actor is already processing a request")]
    ReentrantCall,

    /// The OS refused to spawn a mailbox worker thread.
    #[error("failed to spawn mailbox worker")]
    WorkerSpawn(#[source] std::io::Error),
}

/// Wrapper that marks an error as raised by the *caller's continuation*
/// rather than by the callee's `process_request` body.
///
/// Only `process_request` failures are eligible for the callee's exception
/// handler. A continuation failure travels back through the callee wrapped
/// in this type; the first catcher unwraps it (via downcast) and re-raises
/// the inner error untouched, so the callee's handler never sees it.
#[derive(Debug)]
pub struct TransparentError {
    inner: BoxError,
}

impl TransparentError {
    /// Wrap `inner`, erasing it back to a [`BoxError`].
    pub fn wrap(inner: BoxError) -> BoxError {
        Box::new(Self { inner })
    }

    /// Recover the wrapped error.
    pub fn into_inner(self) -> BoxError {
        self.inner
    }
}

impl fmt::Display for TransparentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "continuation failure: {}", self.inner)
    }
}

impl std::error::Error for TransparentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let inner: &(dyn std::error::Error + 'static) = self.inner.as_ref();
        Some(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transparent_unwrap_by_downcast() {
        let original: BoxError = "boom".into();
        let wrapped = TransparentError::wrap(original);

        let unwrapped = match wrapped.downcast::<TransparentError>() {
            Ok(transparent) => transparent.into_inner(),
            Err(_) => panic!("expected a transparent wrapper"),
        };
        assert_eq!(unwrapped.to_string(), "boom");
    }

    #[test]
    fn test_plain_error_is_not_transparent() {
        let plain: BoxError = "boom".into();
        assert!(plain.downcast::<TransparentError>().is_err());
    }

    #[test]
    fn test_transparent_display_names_the_inner_error() {
        let wrapped = TransparentError::wrap("boom".into());
        assert_eq!(wrapped.to_string(), "continuation failure: boom");
    }
}
