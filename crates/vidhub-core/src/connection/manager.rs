/*!
 * Connection state holder with wait primitives.
 *
 * A [`ConnectionManager`] is the single authority over one connection's
 * lifecycle. Devices drive it, any number of observers wait on it.
 */
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::connection::ConnectionState;
use crate::error::{Error, Result};
use crate::event::{EventChannel, EventReceiver};
use crate::utils::with_optional_timeout;

/// Error object retained alongside a failure reason
pub type FailureError = Arc<anyhow::Error>;

/// A single state transition, published to subscribers in transition order
#[derive(Debug, Clone)]
pub struct StateChange {
    /// State before the transition
    pub old: ConnectionState,
    /// State after the transition
    pub new: ConnectionState,
    /// Failure reason in effect after the transition
    pub failure_reason: Option<String>,
    /// When the transition happened
    pub at: DateTime<Utc>,
}

/// Snapshot of everything a manager holds
#[derive(Debug, Clone, Default)]
pub struct ConnectionStatus {
    /// Current state
    pub state: ConnectionState,
    /// Human-readable failure description
    pub failure_reason: Option<String>,
    /// Underlying error of the last failure
    pub failure_error: Option<FailureError>,
}

impl ConnectionStatus {
    fn same_as(&self, other: &ConnectionStatus) -> bool {
        let same_error = match (&self.failure_error, &other.failure_error) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        self.state == other.state && self.failure_reason == other.failure_reason && same_error
    }
}

/// Async-safe holder of a [`ConnectionState`] and its failure detail
#[derive(Debug, Default)]
pub struct ConnectionManager {
    status: Mutex<ConnectionStatus>,
    changes: EventChannel<StateChange>,
}

impl ConnectionManager {
    /// State used by [`ConnectionManager::set_failure`] callers that have no better choice
    pub const DEFAULT_FAILURE_STATE: ConnectionState =
        ConnectionState::DISCONNECTING.union(ConnectionState::FAILURE);

    /// Create a manager in the `not_connected` state
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a manager starting in `state`
    pub fn with_state(state: ConnectionState) -> Self {
        let manager = Self::default();
        manager.lock().state = state;
        manager
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Snapshot of state and failure detail
    pub fn status(&self) -> ConnectionStatus {
        self.lock().clone()
    }

    /// Reason of the current failure, if any
    pub fn failure_reason(&self) -> Option<String> {
        self.lock().failure_reason.clone()
    }

    /// Error object of the current failure, if any
    pub fn failure_error(&self) -> Option<FailureError> {
        self.lock().failure_error.clone()
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> EventReceiver<StateChange> {
        self.changes.subscribe()
    }

    // Published while the status lock is held so receivers see transitions in
    // the order they were stored. No subscriber code runs inside publish.
    fn notify(&self, status: &ConnectionStatus, old: ConnectionState) {
        debug!(old = %old, new = %status.state, "Connection state changed");
        self.changes.publish(StateChange {
            old,
            new: status.state,
            failure_reason: status.failure_reason.clone(),
            at: Utc::now(),
        });
    }

    /// Move to `state`
    ///
    /// A present `failure` is cleared (with its reason and error) only by a
    /// transition into `connecting` or `connected`; any other target keeps
    /// the `failure` flag.
    pub fn set_state(&self, state: ConnectionState) {
        let mut status = self.lock();
        let mut state = state;
        if status.state.is_failure() {
            if state.intersects(ConnectionState::CONNECTING | ConnectionState::CONNECTED) {
                state.remove(ConnectionState::FAILURE);
                status.failure_reason = None;
                status.failure_error = None;
            } else {
                state.insert(ConnectionState::FAILURE);
            }
        }
        if state == status.state {
            return;
        }
        let old = status.state;
        status.state = state;
        self.notify(&status, old);
    }

    /// Record a failure
    ///
    /// `state` must contain [`ConnectionState::FAILURE`]. State, reason and
    /// error are overwritten without the clearing rules of `set_state`.
    pub fn set_failure<S: Into<String>>(
        &self,
        reason: S,
        error: Option<anyhow::Error>,
        state: ConnectionState,
    ) -> Result<()> {
        if !state.contains(ConnectionState::FAILURE) {
            return Err(Error::precondition(format!(
                "set_failure requires the failure flag, got '{}'",
                state
            )));
        }
        let mut status = self.lock();
        let old = status.state;
        status.state = state;
        status.failure_reason = Some(reason.into());
        status.failure_error = error.map(Arc::new);
        self.notify(&status, old);
        Ok(())
    }

    /// Return to a clean `not_connected`, dropping any failure
    pub fn reset(&self) {
        let mut status = self.lock();
        let cleared = ConnectionStatus::default();
        if status.same_as(&cleared) {
            return;
        }
        let old = status.state;
        *status = cleared;
        self.notify(&status, old);
    }

    /// Copy state and failure detail from `other`
    ///
    /// Nothing is published when the two managers already agree.
    pub fn syncronize(&self, other: &ConnectionManager) {
        if std::ptr::eq(self, other) {
            return;
        }
        // Lock order: other first, matching the mirroring loop.
        let theirs = other.lock();
        let mut ours = self.lock();
        if ours.same_as(&theirs) {
            return;
        }
        let old = ours.state;
        *ours = theirs.clone();
        drop(theirs);
        self.notify(&ours, old);
    }

    /// Wait for the next state change and return the new state
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<ConnectionState> {
        let mut changes = self.subscribe();
        with_optional_timeout(timeout, async {
            match changes.recv().await {
                Ok(change) => Ok(change.new),
                Err(RecvError::Lagged(_)) => Ok(self.state()),
                Err(RecvError::Closed) => Err(Error::event("state change channel closed")),
            }
        })
        .await
    }

    /// Wait until the state matches `target`
    ///
    /// If either the target or the current state is compound, any overlap
    /// matches; otherwise the states must be equal. The returned state is
    /// masked by `target` when `target` is compound.
    pub async fn wait_for(
        &self,
        target: ConnectionState,
        timeout: Option<Duration>,
    ) -> Result<ConnectionState> {
        let state = self
            .wait_until(timeout, |current| Self::matches(target, current))
            .await?;
        if target.is_compound() {
            Ok(state & target)
        } else {
            Ok(state)
        }
    }

    /// Wait until the connection is either established or has finished failing
    ///
    /// Resolves to `connected`, or to the final `not_connected` state
    /// (possibly with `failure`) when the attempt ended in a disconnect.
    /// `timeout` bounds the whole call, including the wait for the
    /// disconnect to finish.
    pub async fn wait_for_established(&self, timeout: Option<Duration>) -> Result<ConnectionState> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let established = ConnectionState::CONNECTED | ConnectionState::DISCONNECTING;
        let state = self
            .wait_until(timeout, |current| current.intersects(established))
            .await?;
        if state.intersects(ConnectionState::FAILURE | ConnectionState::DISCONNECTING) {
            let remaining =
                deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
            return self.wait_for_disconnected(remaining).await;
        }
        Ok(state)
    }

    /// Wait until the state includes `not_connected`
    pub async fn wait_for_disconnected(&self, timeout: Option<Duration>) -> Result<ConnectionState> {
        self.wait_for(ConnectionState::NOT_CONNECTED, timeout).await
    }

    fn matches(target: ConnectionState, current: ConnectionState) -> bool {
        if target.is_compound() || current.is_compound() {
            target.intersects(current)
        } else {
            target == current
        }
    }

    async fn wait_until<P>(&self, timeout: Option<Duration>, predicate: P) -> Result<ConnectionState>
    where
        P: Fn(ConnectionState) -> bool,
    {
        // Subscribe before reading the current state so no transition slips between.
        let mut changes = self.subscribe();
        let current = self.state();
        if predicate(current) {
            return Ok(current);
        }
        with_optional_timeout(timeout, async {
            loop {
                match changes.recv().await {
                    Ok(change) if predicate(change.new) => return Ok(change.new),
                    Ok(change) => trace!(state = %change.new, "Still waiting"),
                    Err(RecvError::Lagged(_)) => {
                        let current = self.state();
                        if predicate(current) {
                            return Ok(current);
                        }
                    }
                    Err(RecvError::Closed) => {
                        return Err(Error::event("state change channel closed"));
                    }
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::task::yield_now;

    const FAILED_DISCONNECTING: ConnectionState =
        ConnectionState::DISCONNECTING.union(ConnectionState::FAILURE);
    const FAILED_NOT_CONNECTED: ConnectionState =
        ConnectionState::NOT_CONNECTED.union(ConnectionState::FAILURE);

    #[tokio::test]
    async fn test_default_state() {
        let manager = ConnectionManager::new();
        assert_eq!(manager.state(), ConnectionState::NOT_CONNECTED);
        assert!(manager.failure_reason().is_none());
    }

    #[tokio::test]
    async fn test_set_state_notifies_once() {
        let manager = ConnectionManager::new();
        let mut rx = manager.subscribe();

        manager.set_state(ConnectionState::CONNECTING);
        manager.set_state(ConnectionState::CONNECTING);

        let change = rx.recv().await.unwrap();
        assert_eq!(change.old, ConnectionState::NOT_CONNECTED);
        assert_eq!(change.new, ConnectionState::CONNECTING);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscriber_sees_failure_sequence_in_order() {
        let manager = Arc::new(ConnectionManager::new());
        let mut rx = manager.subscribe();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .wait_for(ConnectionState::CONNECTING, Some(Duration::from_secs(1)))
                    .await
            })
        };
        yield_now().await;

        manager.set_state(ConnectionState::CONNECTING);
        manager
            .set_failure("refused", None, FAILED_DISCONNECTING)
            .unwrap();
        manager.set_state(ConnectionState::NOT_CONNECTED);

        assert_eq!(waiter.await.unwrap().unwrap(), ConnectionState::CONNECTING);

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap().new);
        }
        assert_eq!(
            seen,
            vec![ConnectionState::CONNECTING, FAILED_DISCONNECTING, FAILED_NOT_CONNECTED]
        );
    }

    #[tokio::test]
    async fn test_failure_sticks_through_disconnect() {
        let manager = ConnectionManager::new();
        manager
            .set_failure("host unreachable", Some(anyhow::anyhow!("no route")), FAILED_DISCONNECTING)
            .unwrap();

        manager.set_state(ConnectionState::NOT_CONNECTED);
        assert_eq!(manager.state(), FAILED_NOT_CONNECTED);
        assert_eq!(manager.failure_reason().as_deref(), Some("host unreachable"));
        assert!(manager.failure_error().is_some());
    }

    #[tokio::test]
    async fn test_connecting_clears_failure() {
        let manager = ConnectionManager::with_state(ConnectionState::NOT_CONNECTED);
        manager
            .set_failure("refused", Some(anyhow::anyhow!("ECONNREFUSED")), FAILED_NOT_CONNECTED)
            .unwrap();

        manager.set_state(ConnectionState::CONNECTING);
        assert_eq!(manager.state(), ConnectionState::CONNECTING);
        assert!(manager.failure_reason().is_none());
        assert!(manager.failure_error().is_none());
    }

    #[tokio::test]
    async fn test_set_failure_requires_failure_flag() {
        let manager = ConnectionManager::new();
        let err = manager
            .set_failure("oops", None, ConnectionState::DISCONNECTING)
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionViolation(_)));
        assert_eq!(manager.state(), ConnectionState::NOT_CONNECTED);
    }

    #[tokio::test]
    async fn test_wait_returns_next_change() {
        let manager = Arc::new(ConnectionManager::new());
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.wait(Some(Duration::from_secs(1))).await })
        };
        yield_now().await;
        manager.set_state(ConnectionState::CONNECTING);
        assert_eq!(waiter.await.unwrap().unwrap(), ConnectionState::CONNECTING);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let manager = ConnectionManager::new();
        let err = manager.wait(Some(Duration::from_millis(20))).await.unwrap_err();
        assert!(err.is_timeout());

        let err = manager
            .wait_for(ConnectionState::CONNECTED, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_wait_for_compound_overlap() {
        let manager = ConnectionManager::new();
        manager.set_failure("gone", None, FAILED_DISCONNECTING).unwrap();

        // Compound current state, simple target: overlap, unmasked result.
        let state = manager
            .wait_for(ConnectionState::DISCONNECTING, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(state, FAILED_DISCONNECTING);

        // Compound target: result masked by the target.
        let state = manager
            .wait_for(ConnectionState::WAITING, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(state, ConnectionState::DISCONNECTING);
    }

    #[tokio::test]
    async fn test_wait_for_established_connected() {
        let manager = Arc::new(ConnectionManager::new());
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager.wait_for_established(Some(Duration::from_secs(1))).await
            })
        };
        yield_now().await;
        manager.set_state(ConnectionState::CONNECTING);
        manager.set_state(ConnectionState::CONNECTED);
        assert_eq!(waiter.await.unwrap().unwrap(), ConnectionState::CONNECTED);
    }

    #[tokio::test]
    async fn test_wait_for_established_failed() {
        let manager = Arc::new(ConnectionManager::new());
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager.wait_for_established(Some(Duration::from_secs(1))).await
            })
        };
        yield_now().await;
        manager.set_state(ConnectionState::CONNECTING);
        manager.set_failure("refused", None, FAILED_DISCONNECTING).unwrap();
        manager.set_state(ConnectionState::NOT_CONNECTED);
        assert_eq!(waiter.await.unwrap().unwrap(), FAILED_NOT_CONNECTED);
    }

    #[tokio::test]
    async fn test_wait_for_established_timeout_covers_disconnect() {
        let manager = Arc::new(ConnectionManager::new());
        manager.set_state(ConnectionState::CONNECTING);
        {
            let manager = manager.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                manager.set_state(ConnectionState::DISCONNECTING);
            });
        }

        let started = Instant::now();
        let result = manager
            .wait_for_established(Some(Duration::from_millis(200)))
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(manager.state(), ConnectionState::DISCONNECTING);
    }

    #[tokio::test]
    async fn test_syncronize_is_idempotent() {
        let source = ConnectionManager::new();
        let mirror = ConnectionManager::new();
        source.set_failure("lost", None, FAILED_NOT_CONNECTED).unwrap();

        let mut rx = mirror.subscribe();
        mirror.syncronize(&source);
        mirror.syncronize(&source);

        let change = rx.recv().await.unwrap();
        assert_eq!(change.new, FAILED_NOT_CONNECTED);
        assert_eq!(change.failure_reason.as_deref(), Some("lost"));
        assert!(rx.try_recv().is_err());
        assert_eq!(mirror.failure_reason().as_deref(), Some("lost"));
    }

    #[tokio::test]
    async fn test_syncronize_with_self_is_noop() {
        let manager = ConnectionManager::new();
        let mut rx = manager.subscribe();
        manager.syncronize(&manager);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reset_clears_failure() {
        let manager = ConnectionManager::new();
        manager.set_failure("lost", None, FAILED_NOT_CONNECTED).unwrap();
        manager.reset();
        assert_eq!(manager.state(), ConnectionState::NOT_CONNECTED);
        assert!(manager.failure_reason().is_none());
    }
}
