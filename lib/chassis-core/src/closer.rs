//! Teardown actions for resources that outlive a single request.

use std::future::Future;

use chassis_error::{ErrorContext as _, GenericError};
use futures::future::BoxFuture;

/// The shape of teardown carried by a [`Closer`].
///
/// Four shapes cover the teardown signatures that occur in practice: synchronous or
/// asynchronous, infallible or fallible. A resource whose teardown goes by another verb
/// entirely (stop, unsubscribe, disconnect) participates all the same, by nominating that
/// method in the closure it hands over.
pub enum CloseStrategy {
    /// Synchronous and infallible.
    Plain(Box<dyn FnOnce() + Send>),

    /// Synchronous and fallible.
    Fallible(Box<dyn FnOnce() -> Result<(), GenericError> + Send>),

    /// Asynchronous and infallible.
    Contextual(Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>),

    /// Asynchronous and fallible.
    FallibleContextual(Box<dyn FnOnce() -> BoxFuture<'static, Result<(), GenericError>> + Send>),
}

impl CloseStrategy {
    /// Returns the name of this strategy, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Plain(_) => "plain",
            Self::Fallible(_) => "fallible",
            Self::Contextual(_) => "contextual",
            Self::FallibleContextual(_) => "fallible_contextual",
        }
    }
}

/// A named teardown action, dispatched once during runtime shutdown.
///
/// A closer is consumed when it runs, so a given closer can neither run twice nor be registered
/// with two runtimes.
pub struct Closer {
    name: String,
    strategy: CloseStrategy,
}

impl Closer {
    /// Creates a closer from a synchronous, infallible function.
    pub fn plain<N, F>(name: N, f: F) -> Self
    where
        N: Into<String>,
        F: FnOnce() + Send + 'static,
    {
        Self {
            name: name.into(),
            strategy: CloseStrategy::Plain(Box::new(f)),
        }
    }

    /// Creates a closer from a synchronous, fallible function.
    pub fn fallible<N, F>(name: N, f: F) -> Self
    where
        N: Into<String>,
        F: FnOnce() -> Result<(), GenericError> + Send + 'static,
    {
        Self {
            name: name.into(),
            strategy: CloseStrategy::Fallible(Box::new(f)),
        }
    }

    /// Creates a closer from an asynchronous, infallible function.
    ///
    /// The future runs under the runtime's shutdown deadline, and is abandoned if the deadline
    /// elapses before it finishes.
    pub fn contextual<N, F, Fut>(name: N, f: F) -> Self
    where
        N: Into<String>,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            strategy: CloseStrategy::Contextual(Box::new(move || Box::pin(f()))),
        }
    }

    /// Creates a closer from an asynchronous, fallible function.
    ///
    /// The future runs under the runtime's shutdown deadline, and is abandoned if the deadline
    /// elapses before it finishes.
    pub fn fallible_contextual<N, F, Fut>(name: N, f: F) -> Self
    where
        N: Into<String>,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), GenericError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            strategy: CloseStrategy::FallibleContextual(Box::new(move || Box::pin(f()))),
        }
    }

    /// Returns the name of this closer.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the name of this closer's strategy, for logging.
    pub fn kind(&self) -> &'static str {
        self.strategy.kind()
    }

    /// Consumes the closer, running its teardown action.
    ///
    /// Synchronous strategies are run on the blocking pool so a slow teardown cannot stall the
    /// async scheduler.
    ///
    /// # Errors
    ///
    /// If the teardown action fails, or a synchronous action panics, an error is returned.
    pub async fn close(self) -> Result<(), GenericError> {
        match self.strategy {
            CloseStrategy::Plain(f) => {
                tokio::task::spawn_blocking(f)
                    .await
                    .error_context("Closer panicked during close.")?;
                Ok(())
            }
            CloseStrategy::Fallible(f) => tokio::task::spawn_blocking(f)
                .await
                .error_context("Closer panicked during close.")?,
            CloseStrategy::Contextual(f) => {
                f().await;
                Ok(())
            }
            CloseStrategy::FallibleContextual(f) => f().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use chassis_error::generic_error;

    use super::*;

    #[tokio::test]
    async fn plain_runs_and_succeeds() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        let closer = Closer::plain("connection-pool", move || flag.store(true, Ordering::SeqCst));
        assert_eq!(closer.kind(), "plain");

        closer.close().await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn fallible_propagates_error() {
        let closer = Closer::fallible("flaky-handle", || Err(generic_error!("flush failed")));
        assert_eq!(closer.kind(), "fallible");

        let result = closer.close().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn contextual_runs_async() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        let closer = Closer::contextual("subscriber", move || async move {
            tokio::task::yield_now().await;
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(closer.kind(), "contextual");

        closer.close().await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn fallible_contextual_propagates_error() {
        let closer = Closer::fallible_contextual("stream-consumer", || async {
            Err(generic_error!("unsubscribe failed"))
        });
        assert_eq!(closer.kind(), "fallible_contextual");

        let result = closer.close().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn plain_panic_becomes_error() {
        let closer = Closer::plain("panicky", || panic!("teardown exploded"));
        let result = closer.close().await;
        assert!(result.is_err());
    }
}
