//! Shutdown signalling between the runtime and the tasks it supervises.

use std::sync::Arc;

use tokio::sync::watch;

/// Coordinates shutdown signalling across any number of interested tasks.
///
/// Cheap to clone; all clones share the same underlying trigger. Signals registered after the
/// trigger has fired resolve immediately, so late registration cannot miss a shutdown.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownCoordinator {
    /// Registers a new shutdown signal.
    pub fn register(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }

    /// Triggers shutdown, waking every registered signal.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
    }

    /// Returns whether shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender: Arc::new(sender) }
    }
}

/// A signal that resolves once shutdown has been triggered.
///
/// Cheap to clone. If the originating [`ShutdownCoordinator`] is dropped, the signal resolves as
/// if shutdown had been triggered.
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Waits until shutdown is triggered.
    ///
    /// Completes immediately if shutdown has already been triggered. Cancel safe: dropping the
    /// returned future and calling `wait` again observes the same trigger.
    pub async fn wait(&mut self) {
        let _ = self.receiver.wait_for(|triggered| *triggered).await;
    }

    /// Returns whether shutdown has already been triggered.
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }
}
