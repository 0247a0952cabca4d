use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::{Receiver, Sender};
use tokio::sync::Mutex;

/// Broadcasts an operator abort to everything that is waiting on an external process.
///
/// The handle remembers that a shutdown was requested, so listeners created after the signal
/// was sent still observe it through [ShutdownHandle::is_shutdown].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: Sender<()>,
    requested: Arc<AtomicBool>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self {
            sender: tokio::sync::broadcast::channel(1).0,
            requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if let Err(e) = self.sender.send(()) {
            // Nobody is waiting on a process right now, the flag is enough.
            log::debug!("No active shutdown listeners: {e:?}");
        }
    }

    /// Whether a shutdown has been requested at any point in the past.
    pub fn is_shutdown(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn new_listener(&self) -> DelegatedShutdownListener {
        DelegatedShutdownListener::new(self.sender.subscribe(), self.requested.clone())
    }
}

#[derive(Clone, Debug)]
pub struct DelegatedShutdownListener {
    receiver: Arc<Mutex<Receiver<()>>>,
    requested: Arc<AtomicBool>,
}

impl DelegatedShutdownListener {
    pub(crate) fn new(receiver: Receiver<()>, requested: Arc<AtomicBool>) -> Self {
        Self {
            receiver: Arc::new(Mutex::new(receiver)),
            requested,
        }
    }

    /// Point in time check if the shutdown signal has been received.
    pub fn should_shutdown(&mut self) -> bool {
        if self.requested.load(Ordering::SeqCst) {
            return true;
        }

        match self.receiver.try_lock() {
            Ok(mut guard) => match guard.try_recv() {
                Ok(_) => true,
                Err(tokio::sync::broadcast::error::TryRecvError::Closed) => true,
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    /// Wait for the shutdown signal. Safe to race with other futures in a `select!`.
    pub async fn wait_for_shutdown(&mut self) {
        if self.requested.load(Ordering::SeqCst) {
            return;
        }

        // A closed channel means the handle is gone and nothing can request a shutdown anymore.
        if self.receiver.lock().await.recv().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Returned when work was abandoned because an operator requested a shutdown.
#[derive(derive_more::Error, derive_more::Display, Debug, Clone, PartialEq, Eq)]
pub struct CancelledError {
    msg: String,
}

impl Default for CancelledError {
    fn default() -> Self {
        Self {
            msg: "Benchmark cancelled by shutdown signal".to_string(),
        }
    }
}
