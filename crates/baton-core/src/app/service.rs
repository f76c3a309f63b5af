use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::error;

use super::dispatcher::Dispatcher;
use super::watcher::InboxWatcher;
use crate::error::DispatchError;

/// Running dispatcher (and watcher) loops.
/// - `request_shutdown()` stops both after their current iteration
/// - a fatal dispatcher error also requests shutdown
pub struct ServiceGroup {
    shutdown_tx: watch::Sender<bool>,
    dispatcher: JoinHandle<Result<(), DispatchError>>,
    watcher: Option<JoinHandle<()>>,
}

impl ServiceGroup {
    /// Spawn the dispatcher loop and, if given, the watcher loop on the current
    /// tokio runtime.
    pub fn spawn(dispatcher: Arc<Dispatcher>, watcher: Option<Arc<InboxWatcher>>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let rx = shutdown_rx.clone();
        let tx = shutdown_tx.clone();
        let dispatcher = tokio::spawn(async move {
            let result = dispatcher.run(rx).await;
            if result.is_err() {
                let _ = tx.send(true);
            }
            result
        });

        let watcher = watcher.map(|watcher| {
            let rx = shutdown_rx.clone();
            tokio::spawn(async move { watcher.run(rx).await })
        });

        Self {
            shutdown_tx,
            dispatcher,
            watcher,
        }
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Resolves once shutdown has been requested, by anyone.
    pub async fn stopped(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Stop both loops and wait for them. Returns the dispatcher's error,
    /// if it ended with one.
    pub async fn shutdown_and_join(self) -> Result<(), DispatchError> {
        self.request_shutdown();
        if let Some(watcher) = self.watcher
            && let Err(e) = watcher.await
        {
            error!(error = %e, "inbox watcher task failed");
        }
        match self.dispatcher.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "dispatcher task failed");
                Ok(())
            }
        }
    }
}
