/*!
 * A connection manager that mirrors another one.
 */
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::ConnectionManager;

/// How long the mirroring loop waits for a change before re-checking
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The running mirror of one target
#[derive(Debug)]
struct Mirror {
    other: Arc<ConnectionManager>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Mirror {
    async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            warn!("Connection mirror task ended abnormally: {}", e);
        }
    }
}

/// A [`ConnectionManager`] that follows the state of another manager
///
/// The target can be swapped at runtime with [`set_other`](Self::set_other).
/// Call [`close`](Self::close) before disposal; dropping an active instance
/// aborts the mirroring task without waiting for it.
#[derive(Debug)]
pub struct SyncronizedConnectionManager {
    manager: Arc<ConnectionManager>,
    mirror: Mutex<Option<Mirror>>,
    poll_interval: Duration,
}

impl SyncronizedConnectionManager {
    /// Create an unattached manager
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// Create an unattached manager with a custom poll interval
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            manager: Arc::new(ConnectionManager::new()),
            mirror: Mutex::new(None),
            poll_interval,
        }
    }

    /// The mirrored manager, shareable with observers
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// The manager currently being mirrored
    pub async fn other(&self) -> Option<Arc<ConnectionManager>> {
        self.mirror.lock().await.as_ref().map(|m| m.other.clone())
    }

    /// Start mirroring `other`, or stop mirroring with `None`
    ///
    /// The previous mirroring task is stopped and awaited first. When this
    /// returns with a new target, the task has already run once.
    pub async fn set_other(&self, other: Option<Arc<ConnectionManager>>) {
        let mut mirror = self.mirror.lock().await;
        let unchanged = match (mirror.as_ref(), other.as_ref()) {
            (Some(current), Some(other)) => Arc::ptr_eq(&current.other, other),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return;
        }

        if let Some(previous) = mirror.take() {
            previous.stop().await;
        }

        let Some(other) = other else {
            self.manager.reset();
            return;
        };

        self.manager.syncronize(&other);

        let (stop_tx, stop_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(syncronize_loop(
            self.manager.clone(),
            other.clone(),
            self.poll_interval,
            stop_rx,
            ready_tx,
        ));
        let _ = ready_rx.await;

        *mirror = Some(Mirror {
            other,
            stop: stop_tx,
            task,
        });
    }

    /// Stop mirroring and return to `not_connected`
    pub async fn close(&self) {
        self.set_other(None).await;
    }
}

impl Default for SyncronizedConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for SyncronizedConnectionManager {
    type Target = ConnectionManager;

    fn deref(&self) -> &ConnectionManager {
        &self.manager
    }
}

impl Drop for SyncronizedConnectionManager {
    fn drop(&mut self) {
        if let Some(mirror) = self.mirror.get_mut().take() {
            debug!("Aborting connection mirror that was not closed");
            mirror.task.abort();
        }
    }
}

async fn syncronize_loop(
    manager: Arc<ConnectionManager>,
    other: Arc<ConnectionManager>,
    poll_interval: Duration,
    mut stop: oneshot::Receiver<()>,
    ready: oneshot::Sender<()>,
) {
    let mut changes = other.subscribe();
    let mut ready = Some(ready);
    loop {
        manager.syncronize(&other);
        if let Some(ready) = ready.take() {
            let _ = ready.send(());
        }

        tokio::select! {
            _ = &mut stop => break,
            received = tokio::time::timeout(poll_interval, changes.recv()) => match received {
                Ok(Ok(_)) | Err(_) => {}
                Ok(Err(RecvError::Lagged(skipped))) => {
                    debug!("Connection mirror lagged by {} changes", skipped);
                }
                Ok(Err(RecvError::Closed)) => {
                    warn!("Mirrored connection manager closed its change channel");
                    break;
                }
            },
        }
    }
    debug!(state = %manager.state(), "Connection mirror stopped");
}
