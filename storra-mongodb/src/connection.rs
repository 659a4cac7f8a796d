//! Connection lifecycle for networked backends.
//!
//! A networked store must not let concurrent requests race each other into opening
//! connections while the first handshake is still in flight. [`ConnectionManager`] gates
//! every operation on an explicit three-state machine:
//!
//! ```text
//! Disconnected --acquire--> Connecting --established--> Connected
//!      ^                        |                           |
//!      +--------failed----------+                           |
//!      +-----------------------close------------------------+
//! ```
//!
//! The first caller that finds the manager `Disconnected` starts exactly one connect
//! attempt. Every caller (including that first one) then polls: sleep for the retry
//! interval and look again, up to the retry budget. Callers still waiting when their
//! budget runs out get [`StorraError::ConnectionTimeout`].
//!
//! The actual connect/close work is delegated to a [`Connector`], which makes the state
//! machine testable without a database.

use std::{fmt, sync::Arc, time::Duration};
use async_trait::async_trait;
use mea::mutex::Mutex;
use tracing::{debug, error, info, warn};

use storra_core::error::{StorraError, StorraResult};

/// Opens and closes the connection a [`ConnectionManager`] hands out.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// A cheaply cloneable, shareable connection.
    type Connection: Clone + Send + Sync + 'static;

    /// Establishes a connection. Only returns once the connection is usable.
    async fn connect(&self) -> StorraResult<Self::Connection>;

    /// Tears a connection down.
    async fn close(&self, connection: Self::Connection) -> StorraResult<()>;
}

/// The connection state of a networked backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Something that happened to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// An operation wants the connection.
    Acquire,
    /// A connect attempt succeeded.
    Established,
    /// A connect attempt failed.
    Failed,
    /// The connection is being closed on request.
    Close,
}

/// What the manager has to do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Hand out the live connection.
    Proceed,
    /// Start a connect attempt.
    Connect,
    /// Sleep for the retry interval, then acquire again.
    Wait,
    /// Store the freshly established connection.
    Install,
    /// Record the connect failure for the callers waiting on it.
    Record,
    /// Close a connection nobody asked for anymore.
    Discard,
    /// Close the live connection, if any.
    Release,
    /// Nothing to do.
    Ignore,
}

impl ConnectionState {
    /// The transition function of the connection state machine.
    ///
    /// # Errors
    ///
    /// Returns [`StorraError::ConnectionState`] for events that cannot happen in the
    /// current state, e.g. a second connection being established while connected.
    pub fn on(self, event: ConnectionEvent) -> StorraResult<(ConnectionState, Action)> {
        use ConnectionEvent::*;
        use ConnectionState::*;

        match (self, event) {
            (Disconnected, Acquire) => Ok((Connecting, Action::Connect)),
            (Connecting, Acquire) => Ok((Connecting, Action::Wait)),
            (Connected, Acquire) => Ok((Connected, Action::Proceed)),

            (Connecting, Established) => Ok((Connected, Action::Install)),
            (Connecting, Failed) => Ok((Disconnected, Action::Record)),
            // Closed while the attempt was in flight.
            (Disconnected, Established) => Ok((Disconnected, Action::Discard)),
            (Disconnected, Failed) => Ok((Disconnected, Action::Ignore)),

            (_, Close) => Ok((Disconnected, Action::Release)),

            (Connected, Established) | (Connected, Failed) => Err(StorraError::ConnectionState(format!(
                "unexpected {event:?} while already {self:?}"
            ))),
        }
    }
}

/// How long callers poll a connection that is being established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 20,
            interval: Duration::from_millis(50),
        }
    }
}

struct Slot<C> {
    state: ConnectionState,
    connection: Option<C>,
    /// Incremented for every connect attempt; identifies stale completions.
    generation: u64,
    failure: Option<(u64, StorraError)>,
    retry: RetryPolicy,
}

/// Gates access to a shared connection behind the connection state machine.
pub struct ConnectionManager<K: Connector> {
    connector: Arc<K>,
    slot: Arc<Mutex<Slot<K::Connection>>>,
}

impl<K: Connector> ConnectionManager<K> {
    pub fn new(connector: K, retry: RetryPolicy) -> Self {
        Self {
            connector: Arc::new(connector),
            slot: Arc::new(Mutex::new(Slot {
                state: ConnectionState::Disconnected,
                connection: None,
                generation: 0,
                failure: None,
                retry,
            })),
        }
    }

    pub fn connector(&self) -> &K {
        &self.connector
    }

    pub async fn state(&self) -> ConnectionState {
        self.slot.lock().await.state
    }

    pub async fn retry_policy(&self) -> RetryPolicy {
        self.slot.lock().await.retry
    }

    /// Changes the retry budget for callers that start waiting from now on.
    pub async fn set_retry_policy(&self, retry: RetryPolicy) {
        self.slot.lock().await.retry = retry;
    }

    /// Returns the shared connection, connecting first if necessary.
    ///
    /// # Errors
    ///
    /// - [`StorraError::ConnectionTimeout`] if the connection is still being established
    ///   after the retry budget is spent
    /// - the connector's error if the attempt this caller waited on failed
    /// - [`StorraError::ConnectionState`] if the manager reaches an inconsistent state
    pub async fn acquire(&self) -> StorraResult<K::Connection> {
        let mut polls = 0;
        let mut waiting_on = None;

        loop {
            let (action, generation, retry) = {
                let mut slot = self.slot.lock().await;

                if slot.state == ConnectionState::Disconnected {
                    if let (Some(waited), Some((failed, err))) = (waiting_on, &slot.failure) {
                        if waited == *failed {
                            return Err(err.clone());
                        }
                    }
                }

                let (next, action) = slot.state.on(ConnectionEvent::Acquire)?;
                slot.state = next;

                match action {
                    Action::Proceed => {
                        return slot.connection.clone().ok_or_else(|| {
                            StorraError::ConnectionState("connected without a live connection".into())
                        });
                    }
                    Action::Connect => {
                        slot.generation += 1;
                        slot.failure = None;
                    }
                    _ => {}
                }

                (action, slot.generation, slot.retry)
            };

            match action {
                Action::Connect => {
                    debug!(generation, "not connected yet, establishing connection");
                    self.spawn_connect(generation);
                    waiting_on = Some(generation);
                }
                Action::Wait => {
                    waiting_on = Some(generation);
                    if polls >= retry.max_retries {
                        error!(retries = retry.max_retries, "connection still being established, giving up");
                        return Err(StorraError::ConnectionTimeout(format!(
                            "could not connect after {} retries, connection is still being established",
                            retry.max_retries
                        )));
                    }
                    polls += 1;
                    debug!(polls, "connection is being established, waiting");
                    tokio::time::sleep(retry.interval).await;
                }
                other => {
                    return Err(StorraError::ConnectionState(format!(
                        "unexpected action {other:?} while acquiring"
                    )));
                }
            }
        }
    }

    /// Closes the shared connection. The next [`acquire`](Self::acquire) reconnects.
    pub async fn close(&self) -> StorraResult<()> {
        let connection = {
            let mut slot = self.slot.lock().await;
            let (next, _) = slot.state.on(ConnectionEvent::Close)?;
            slot.state = next;
            slot.connection.take()
        };

        match connection {
            Some(connection) => {
                info!("closing connection");
                self.connector.close(connection).await
            }
            None => Ok(()),
        }
    }

    /// Runs one connect attempt detached from the caller, so an abandoned request
    /// cannot cancel a handshake other callers are waiting on.
    fn spawn_connect(&self, generation: u64) {
        let connector = Arc::clone(&self.connector);
        let slot = Arc::clone(&self.slot);

        tokio::spawn(async move {
            let result = connector.connect().await;

            let stray = {
                let mut slot = slot.lock().await;
                if slot.generation != generation {
                    debug!(generation, "stale connect attempt finished");
                    result.ok()
                } else {
                    let event = match result {
                        Ok(_) => ConnectionEvent::Established,
                        Err(_) => ConnectionEvent::Failed,
                    };
                    match slot.state.on(event) {
                        Ok((next, action)) => {
                            slot.state = next;
                            match (action, result) {
                                (Action::Install, Ok(connection)) => {
                                    info!(generation, "connection established");
                                    slot.connection = Some(connection);
                                    None
                                }
                                (Action::Record, Err(err)) => {
                                    warn!(generation, %err, "connect attempt failed");
                                    slot.failure = Some((generation, err));
                                    None
                                }
                                (_, result) => result.ok(),
                            }
                        }
                        Err(err) => {
                            error!(%err, "connect attempt finished in an inconsistent state");
                            result.ok()
                        }
                    }
                }
            };

            if let Some(connection) = stray {
                if let Err(err) = connector.close(connection).await {
                    warn!(%err, "failed to close unused connection");
                }
            }
        });
    }
}

impl<K: Connector> fmt::Debug for ConnectionManager<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use futures::future::join_all;

    /// Counts attempts; each connect takes `delay`, or never finishes when `delay` is `None`.
    struct FakeConnector {
        attempts: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        delay: Option<Duration>,
        fail: bool,
    }

    impl FakeConnector {
        fn new(delay: Option<Duration>) -> Self {
            Self {
                attempts: Arc::new(AtomicUsize::new(0)),
                closes: Arc::new(AtomicUsize::new(0)),
                delay,
                fail: false,
            }
        }

        fn failing() -> Self {
            Self { fail: true, ..Self::new(Some(Duration::from_millis(5))) }
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        type Connection = usize;

        async fn connect(&self) -> StorraResult<usize> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match self.delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => futures::future::pending::<()>().await,
            }
            if self.fail {
                return Err(StorraError::Backend("connection refused".into()));
            }
            Ok(attempt)
        }

        async fn close(&self, _connection: usize) -> StorraResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy { max_retries, interval: Duration::from_millis(5) }
    }

    #[test]
    fn transition_table() {
        use ConnectionEvent::*;
        use ConnectionState::*;

        assert_eq!(Disconnected.on(Acquire).unwrap(), (Connecting, Action::Connect));
        assert_eq!(Connecting.on(Acquire).unwrap(), (Connecting, Action::Wait));
        assert_eq!(Connected.on(Acquire).unwrap(), (Connected, Action::Proceed));
        assert_eq!(Connecting.on(Established).unwrap(), (Connected, Action::Install));
        assert_eq!(Connecting.on(Failed).unwrap(), (Disconnected, Action::Record));
        assert_eq!(Disconnected.on(Established).unwrap(), (Disconnected, Action::Discard));
        assert_eq!(Connected.on(Close).unwrap(), (Disconnected, Action::Release));
        assert_eq!(Connecting.on(Close).unwrap(), (Disconnected, Action::Release));

        let err = Connected.on(Established).unwrap_err();
        assert!(matches!(err, StorraError::ConnectionState(_)));
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn default_retry_policy() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.max_retries, 20);
        assert_eq!(retry.interval, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_attempt() {
        let connector = FakeConnector::new(Some(Duration::from_millis(20)));
        let attempts = Arc::clone(&connector.attempts);
        let manager = ConnectionManager::new(connector, fast_retry(50));

        let results = join_all((0..8).map(|_| manager.acquire())).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap(), 1);
        }
        assert_eq!(manager.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn every_waiter_times_out_when_connect_hangs() {
        let connector = FakeConnector::new(None);
        let attempts = Arc::clone(&connector.attempts);
        let manager = ConnectionManager::new(connector, fast_retry(4));

        let results = join_all((0..5).map(|_| manager.acquire())).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(results.len(), 5);
        for result in results {
            assert!(matches!(result, Err(StorraError::ConnectionTimeout(_))));
        }
        assert_eq!(manager.state().await, ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn failed_attempt_is_reported_to_its_waiters() {
        let manager = ConnectionManager::new(FakeConnector::failing(), fast_retry(50));

        let results = join_all((0..3).map(|_| manager.acquire())).await;

        for result in results {
            assert_eq!(result.unwrap_err(), StorraError::Backend("connection refused".into()));
        }
        assert_eq!(manager.connector().attempts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn close_then_reconnect() {
        let manager = ConnectionManager::new(FakeConnector::new(Some(Duration::from_millis(1))), fast_retry(50));

        assert_eq!(manager.acquire().await.unwrap(), 1);
        assert_eq!(manager.acquire().await.unwrap(), 1);

        manager.close().await.unwrap();
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert_eq!(manager.connector().closes.load(Ordering::SeqCst), 1);

        assert_eq!(manager.acquire().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn close_while_disconnected_is_fine() {
        let manager = ConnectionManager::new(FakeConnector::new(Some(Duration::from_millis(1))), fast_retry(5));

        manager.close().await.unwrap();
        assert_eq!(manager.connector().closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retry_policy_can_be_changed() {
        let manager = ConnectionManager::new(FakeConnector::new(None), RetryPolicy::default());
        manager.set_retry_policy(fast_retry(1)).await;

        assert_eq!(manager.retry_policy().await, fast_retry(1));
        assert!(matches!(manager.acquire().await, Err(StorraError::ConnectionTimeout(_))));
    }
}
