use std::future::Future;

use crate::shutdown::{CancelledError, ShutdownHandle};

/// Runs async process supervision on behalf of synchronous callers.
///
/// The benchmark pipeline is sequential, so every call blocks until its future completes. A
/// requested shutdown drops the in-flight future, which is expected to clean up after itself
/// (for example child processes spawned with `kill_on_drop`).
#[derive(Debug)]
pub struct Executor {
    runtime: tokio::runtime::Runtime,
    shutdown_handle: ShutdownHandle,
}

impl Executor {
    pub fn new(runtime: tokio::runtime::Runtime, shutdown_handle: ShutdownHandle) -> Self {
        Self {
            runtime,
            shutdown_handle,
        }
    }

    /// Build an executor on a small dedicated runtime, with no Ctrl-C handling.
    pub fn try_default() -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()?;

        Ok(Self::new(runtime, ShutdownHandle::default()))
    }

    /// Build an executor whose shutdown handle is triggered by Ctrl-C.
    pub fn with_ctrl_c() -> std::io::Result<Self> {
        let executor = Self::try_default()?;

        let listener_handle = executor.shutdown_handle.clone();
        executor.runtime.spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    log::warn!("Received shutdown signal, cancelling running benchmarks...");
                    listener_handle.shutdown();
                }
                Err(e) => log::error!("Failed to listen for Ctrl-C: {e}"),
            }
        });

        Ok(executor)
    }

    pub fn shutdown_handle(&self) -> &ShutdownHandle {
        &self.shutdown_handle
    }

    /// Run async code in place, blocking until it completes or a shutdown is requested.
    pub fn execute_in_place<T>(&self, fut: impl Future<Output = T>) -> Result<T, CancelledError> {
        if self.shutdown_handle.is_shutdown() {
            return Err(CancelledError::default());
        }

        let mut shutdown_listener = self.shutdown_handle.new_listener();
        self.runtime.block_on(async move {
            tokio::select! {
                result = fut => Ok(result),
                _ = shutdown_listener.wait_for_shutdown() => Err(CancelledError::default()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn completes_future() {
        let executor = Executor::try_default().unwrap();
        let value = executor.execute_in_place(async { 7 }).unwrap();
        assert_eq!(7, value);
    }

    #[test]
    fn refuses_work_after_shutdown() {
        let executor = Executor::try_default().unwrap();
        executor.shutdown_handle().shutdown();

        let result = executor.execute_in_place(async { 7 });
        assert_eq!(Err(CancelledError::default()), result);
    }

    #[test]
    fn cancels_in_flight_future() {
        let executor = Executor::try_default().unwrap();
        let handle = executor.shutdown_handle().clone();

        let result = executor.execute_in_place(async move {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                handle.shutdown();
            });
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        assert!(result.is_err());
    }
}
