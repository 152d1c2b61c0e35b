/*!
 * Connection-owning client for the line protocol.
 *
 * A [`TelnetClient`] owns one transport at a time. A background read loop
 * is the only consumer of incoming bytes: it feeds the section parser,
 * publishes change events and resolves command replies. Commands are
 * written under a per-property lock, and their replies are matched in wire
 * order through a queue of pending reply slots.
 */
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{oneshot, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use vidhub_core::config::ConnectionConfig;
use vidhub_core::connection::{ConnectionManager, ConnectionState};
use vidhub_core::event::{EventChannel, EventReceiver};
use vidhub_core::logging::component_span;
use vidhub_core::utils::spawn_and_log;

use crate::device::{DeviceError, Result};
use crate::protocol::{Reply, SectionParser, TelnetProtocol};
use crate::transport::{Connector, TcpConnector, TransportReader, TransportWriter};

/// Default TCP port of the devices
pub const DEFAULT_PORT: u16 = 9990;

/// Timeouts used by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// Bound on waiting for the prelude after the transport opens
    pub prelude_timeout: Duration,
    /// Bound on waiting for the reply to a command
    pub ack_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            prelude_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&ConnectionConfig> for ClientOptions {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            prelude_timeout: config.prelude_timeout(),
            ack_timeout: config.ack_timeout(),
        }
    }
}

/// Named async locks serializing writes to one device property
#[derive(Debug, Default)]
pub struct PropertyLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PropertyLocks {
    /// Wait for exclusive access to `property`
    pub async fn acquire(&self, property: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(property.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Debug)]
struct ReadLoop {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone)]
struct Endpoint {
    host: String,
    port: u16,
}

struct Shared<P: TelnetProtocol> {
    endpoint: Mutex<Endpoint>,
    connector: Arc<dyn Connector>,
    options: ClientOptions,
    connection: Arc<ConnectionManager>,
    state: RwLock<P::State>,
    events: EventChannel<P::Event>,
    writer: tokio::sync::Mutex<Option<Box<dyn TransportWriter>>>,
    pending_replies: Mutex<VecDeque<oneshot::Sender<Reply>>>,
    read_loop: Mutex<Option<ReadLoop>>,
    prelude_parsed: AtomicBool,
    // Bumped whenever a connection is opened or torn down; faults carrying
    // an older value belong to a connection that is already gone.
    session: AtomicU64,
    // Held while a fault claims the session or a connect marks it established.
    transition: Mutex<()>,
    lifecycle: tokio::sync::Mutex<()>,
    property_locks: PropertyLocks,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<P: TelnetProtocol> Shared<P> {
    fn endpoint(&self) -> Endpoint {
        lock(&self.endpoint).clone()
    }

    fn take_read_loop(&self) -> Option<ReadLoop> {
        lock(&self.read_loop).take()
    }

    fn drop_pending_replies(&self) {
        let dropped = lock(&self.pending_replies).drain(..).count();
        if dropped > 0 {
            debug!(protocol = P::NAME, "Dropped {} pending replies", dropped);
        }
    }

    fn resolve_reply(&self, reply: Reply) {
        match lock(&self.pending_replies).pop_front() {
            // The writer may have given up waiting; its slot still consumes
            // the reply so later commands stay aligned.
            Some(slot) => {
                let _ = slot.send(reply);
            }
            None => debug!(protocol = P::NAME, "Unsolicited {:?}", reply),
        }
    }

    fn ingest(&self, parser: &mut SectionParser<P>, data: &[u8]) -> bool {
        let output = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            parser.feed(data, &mut state)
        };
        self.events.publish_all(output.events);
        for reply in output.replies {
            self.resolve_reply(reply);
        }
        if output.prelude_completed {
            self.prelude_parsed.store(true, Ordering::SeqCst);
        }
        output.prelude_completed
    }

    /// Record a connection fault and tear the connection down
    async fn handle_fault(&self, session: u64, reason: String, error: anyhow::Error) {
        {
            let _transition = lock(&self.transition);
            if self
                .session
                .compare_exchange(session, session + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                debug!(protocol = P::NAME, "Ignoring fault of a closed connection: {}", reason);
                return;
            }

            warn!(protocol = P::NAME, "{}", reason);
            if let Err(e) = self.connection.set_failure(
                reason,
                Some(error),
                ConnectionManager::DEFAULT_FAILURE_STATE,
            ) {
                warn!("Failed to record connection failure: {}", e);
            }
        }

        if let Some(read_loop) = self.take_read_loop() {
            let _ = read_loop.stop.send(());
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.close().await {
                debug!(protocol = P::NAME, "Error closing transport: {}", e);
            }
        }
        self.drop_pending_replies();
        self.prelude_parsed.store(false, Ordering::SeqCst);
        self.connection.set_state(ConnectionState::NOT_CONNECTED);
    }
}

async fn read_loop<P: TelnetProtocol>(
    shared: Arc<Shared<P>>,
    session: u64,
    mut reader: Box<dyn TransportReader>,
    mut stop: oneshot::Receiver<()>,
    prelude_done: oneshot::Sender<()>,
) -> Result<()> {
    let mut parser = SectionParser::<P>::new();
    let mut prelude_done = Some(prelude_done);

    loop {
        let ready = tokio::select! {
            _ = &mut stop => return Ok(()),
            ready = reader.wait_until_data_ready() => ready,
        };
        let data = match ready.and_then(|_| reader.read_available()) {
            Ok(data) => data,
            Err(e) => {
                let reason = format!("Connection to device lost: {}", e);
                shared
                    .handle_fault(session, reason.clone(), anyhow::Error::new(e))
                    .await;
                return Err(DeviceError::Transport(reason));
            }
        };
        if data.is_empty() {
            continue;
        }
        if shared.ingest(&mut parser, &data) {
            if let Some(done) = prelude_done.take() {
                let _ = done.send(());
            }
        }
    }
}

/// Client for one device speaking protocol `P`
pub struct TelnetClient<P: TelnetProtocol> {
    shared: Arc<Shared<P>>,
}

impl<P: TelnetProtocol> std::fmt::Debug for TelnetClient<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let endpoint = self.shared.endpoint();
        f.debug_struct("TelnetClient")
            .field("protocol", &P::NAME)
            .field("host", &endpoint.host)
            .field("port", &endpoint.port)
            .field("state", &self.shared.connection.state())
            .finish()
    }
}

impl<P: TelnetProtocol> TelnetClient<P> {
    /// Create a client; nothing is opened until [`connect`](Self::connect)
    pub fn new(
        host: impl Into<String>,
        port: u16,
        connector: Arc<dyn Connector>,
        options: ClientOptions,
    ) -> Self {
        let shared = Shared {
            endpoint: Mutex::new(Endpoint {
                host: host.into(),
                port,
            }),
            connector,
            options,
            connection: Arc::new(ConnectionManager::new()),
            state: RwLock::new(P::State::default()),
            events: EventChannel::new(),
            writer: tokio::sync::Mutex::new(None),
            pending_replies: Mutex::new(VecDeque::new()),
            read_loop: Mutex::new(None),
            prelude_parsed: AtomicBool::new(false),
            session: AtomicU64::new(0),
            transition: Mutex::new(()),
            lifecycle: tokio::sync::Mutex::new(()),
            property_locks: PropertyLocks::default(),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Create a TCP client with default options
    pub fn with_tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, Arc::new(TcpConnector::new()), ClientOptions::default())
    }

    /// Host the client connects to
    pub fn hostaddr(&self) -> String {
        self.shared.endpoint().host
    }

    /// Port the client connects to
    pub fn hostport(&self) -> u16 {
        self.shared.endpoint().port
    }

    /// Timeouts in use
    pub fn options(&self) -> ClientOptions {
        self.shared.options
    }

    /// Connection state tracker
    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.shared.connection
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.shared.connection.state()
    }

    /// Whether the prelude has completed on the current connection
    pub fn prelude_parsed(&self) -> bool {
        self.shared.prelude_parsed.load(Ordering::SeqCst)
    }

    /// Subscribe to device change events
    pub fn subscribe(&self) -> EventReceiver<P::Event> {
        self.shared.events.subscribe()
    }

    /// Copy of the device state
    pub fn snapshot(&self) -> P::State {
        self.read(|state| state.clone())
    }

    /// Run `f` against the device state
    pub fn read<R>(&self, f: impl FnOnce(&P::State) -> R) -> R {
        let state = self.shared.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    /// Open the transport and wait for the prelude
    ///
    /// Already connected clients return immediately. Any failure is
    /// recorded on the connection manager and leaves the client
    /// `not_connected|failure`.
    pub async fn connect(&self) -> ConnectionState {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let endpoint = self.shared.endpoint();
        let span = component_span(P::NAME, Some(&format!("{}:{}", endpoint.host, endpoint.port)));
        self.connect_locked(endpoint).instrument(span).await
    }

    async fn connect_locked(&self, endpoint: Endpoint) -> ConnectionState {
        let shared = &self.shared;
        if shared.connection.state().is_connected() {
            return shared.connection.state();
        }

        shared.connection.set_state(ConnectionState::CONNECTING);
        let session = shared.session.fetch_add(1, Ordering::SeqCst) + 1;

        let halves = match shared.connector.open(&endpoint.host, endpoint.port).await {
            Ok(halves) => halves,
            Err(e) => {
                let reason = format!(
                    "Could not connect to {}:{}: {}",
                    endpoint.host, endpoint.port, e
                );
                shared
                    .handle_fault(session, reason, anyhow::Error::new(e))
                    .await;
                return shared.connection.state();
            }
        };
        debug!("Transport open, waiting for prelude");

        *shared.writer.lock().await = Some(halves.writer);
        shared.prelude_parsed.store(false, Ordering::SeqCst);

        let (done_tx, done_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = spawn_and_log(
            &format!("{} read loop", P::NAME),
            read_loop(shared.clone(), session, halves.reader, stop_rx, done_tx),
        );
        *lock(&shared.read_loop) = Some(ReadLoop {
            stop: stop_tx,
            handle,
        });

        match tokio::time::timeout(shared.options.prelude_timeout, done_rx).await {
            Ok(Ok(())) => {
                let established = {
                    let _transition = lock(&shared.transition);
                    // A fault right after the prelude has already torn this session down.
                    let current = shared.session.load(Ordering::SeqCst) == session;
                    if current {
                        shared.connection.set_state(ConnectionState::CONNECTED);
                    }
                    current
                };
                if established {
                    let id = self.read(|state| P::device_id(state).map(str::to_string));
                    info!(device_id = ?id, "Connected");
                }
            }
            // The read loop ended first and has already recorded why.
            Ok(Err(_)) => {}
            Err(_) => {
                let reason = format!(
                    "No prelude from {}:{} within {:?}",
                    endpoint.host, endpoint.port, shared.options.prelude_timeout
                );
                shared
                    .handle_fault(session, reason.clone(), anyhow::anyhow!(reason))
                    .await;
            }
        }
        shared.connection.state()
    }

    /// Close the transport and stop the read loop
    pub async fn disconnect(&self) -> ConnectionState {
        let _lifecycle = self.shared.lifecycle.lock().await;
        self.disconnect_locked().await
    }

    async fn disconnect_locked(&self) -> ConnectionState {
        let shared = &self.shared;
        let read_loop = shared.take_read_loop();
        let writer = shared.writer.lock().await.take();
        if read_loop.is_none() && writer.is_none() {
            return shared.connection.state();
        }

        shared.connection.set_state(ConnectionState::DISCONNECTING);
        shared.session.fetch_add(1, Ordering::SeqCst);

        if let Some(read_loop) = read_loop {
            let _ = read_loop.stop.send(());
            if let Err(e) = read_loop.handle.await {
                warn!(protocol = P::NAME, "Read loop ended abnormally: {}", e);
            }
        }
        if let Some(mut writer) = writer {
            if let Err(e) = writer.close().await {
                debug!(protocol = P::NAME, "Error closing transport: {}", e);
            }
        }
        shared.drop_pending_replies();
        shared.prelude_parsed.store(false, Ordering::SeqCst);
        shared.connection.set_state(ConnectionState::NOT_CONNECTED);
        info!(protocol = P::NAME, "Disconnected");
        shared.connection.state()
    }

    /// Point the client at a new address
    ///
    /// The client disconnects and connects to the new address. Only a
    /// client that was deliberately disconnected (plain `not_connected`)
    /// stays disconnected. Device state and subscribers are kept.
    pub async fn reset_hostaddr(&self, host: impl Into<String>, port: u16) -> ConnectionState {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let reconnect = self.state() != ConnectionState::NOT_CONNECTED;
        self.disconnect_locked().await;

        let endpoint = Endpoint {
            host: host.into(),
            port,
        };
        info!(protocol = P::NAME, "Address set to {}:{}", endpoint.host, endpoint.port);
        *lock(&self.shared.endpoint) = endpoint.clone();

        if !reconnect {
            return self.state();
        }
        let span = component_span(P::NAME, Some(&format!("{}:{}", endpoint.host, endpoint.port)));
        self.connect_locked(endpoint).instrument(span).await
    }

    /// Send a command block and apply it locally once acknowledged
    ///
    /// Writers of the same `property` are serialized. Returns `Ok(true)` on
    /// ACK, after `apply` has run; `Ok(false)` on NAK or when the client is
    /// not connected or the connection drops. A missing reply is an error.
    pub async fn send_command<F>(&self, property: &str, block: String, apply: F) -> Result<bool>
    where
        F: FnOnce(&mut P::State, &mut Vec<P::Event>),
    {
        let shared = &self.shared;
        let _guard = shared.property_locks.acquire(property).await;

        if !shared.connection.state().is_connected() {
            debug!(protocol = P::NAME, "Not connected, dropping {} command", property);
            return Ok(false);
        }

        let reply = {
            let mut writer = shared.writer.lock().await;
            let Some(transport) = writer.as_mut() else {
                return Ok(false);
            };
            let (slot, reply) = oneshot::channel();
            lock(&shared.pending_replies).push_back(slot);

            if let Err(e) = transport.write(block.as_bytes()).await {
                drop(writer);
                let reason = format!("Failed to send {} command: {}", property, e);
                let session = shared.session.load(Ordering::SeqCst);
                shared
                    .handle_fault(session, reason, anyhow::Error::new(e))
                    .await;
                return Ok(false);
            }
            reply
        };

        match tokio::time::timeout(shared.options.ack_timeout, reply).await {
            Ok(Ok(Reply::Ack)) => {
                let mut events = Vec::new();
                {
                    let mut state = shared.state.write().unwrap_or_else(PoisonError::into_inner);
                    apply(&mut state, &mut events);
                }
                shared.events.publish_all(events);
                Ok(true)
            }
            Ok(Ok(Reply::Nak)) => {
                debug!(protocol = P::NAME, "Device rejected {} command", property);
                Ok(false)
            }
            Ok(Err(_)) => Ok(false),
            Err(_) => Err(DeviceError::Timeout(format!(
                "No reply to {} command within {:?}",
                property, shared.options.ack_timeout
            ))),
        }
    }
}

impl<P: TelnetProtocol> Drop for TelnetClient<P> {
    fn drop(&mut self) {
        if let Some(read_loop) = self.shared.take_read_loop() {
            let _ = read_loop.stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{split_index, ProtocolViolation};
    use crate::transport::mock::MockConnector;

    struct Echo;

    #[derive(Debug, Clone, Default)]
    struct EchoState {
        value: String,
        id: Option<String>,
    }

    impl TelnetProtocol for Echo {
        type State = EchoState;
        type Event = String;
        const NAME: &'static str = "echo";

        fn is_section_header(line: &str) -> bool {
            matches!(line, "VALUE:" | "END PRELUDE:")
        }

        fn parse_line(
            state: &mut EchoState,
            _section: &str,
            line: &str,
            events: &mut Vec<String>,
        ) -> std::result::Result<(), ProtocolViolation> {
            if let Some((_, value)) = split_index(line) {
                state.value = value.to_string();
                state.id = Some("echo-1".to_string());
                events.push(value.to_string());
            }
            Ok(())
        }

        fn ends_prelude(_state: &EchoState, section: &str) -> bool {
            section == "END PRELUDE:"
        }

        fn device_id(state: &EchoState) -> Option<&str> {
            state.id.as_deref()
        }
    }

    const PRELUDE: &str = "VALUE:\n0 start\n\nEND PRELUDE:\n\n";

    fn options() -> ClientOptions {
        ClientOptions {
            prelude_timeout: Duration::from_millis(500),
            ack_timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_connect_waits_for_prelude() {
        let (connector, mut sessions) = MockConnector::new();
        let client = Arc::new(TelnetClient::<Echo>::new("10.0.0.9", 9990, connector, options()));

        let connecting = {
            let client = client.clone();
            tokio::spawn(async move { client.connect().await })
        };
        let session = sessions.recv().await.unwrap();
        assert_eq!((session.host.as_str(), session.port), ("10.0.0.9", 9990));
        assert!(!client.prelude_parsed());

        session.send(PRELUDE);
        assert_eq!(connecting.await.unwrap(), ConnectionState::CONNECTED);
        assert!(client.prelude_parsed());
        assert_eq!(client.snapshot().value, "start");
    }

    #[tokio::test]
    async fn test_prelude_timeout_is_a_failure() {
        let (connector, mut sessions) = MockConnector::new();
        let client = TelnetClient::<Echo>::new("10.0.0.9", 9990, connector, options());

        let (state, _session) = tokio::join!(client.connect(), sessions.recv());
        assert_eq!(state, ConnectionState::NOT_CONNECTED | ConnectionState::FAILURE);
        assert!(client
            .connection_manager()
            .failure_reason()
            .unwrap()
            .contains("prelude"));
    }

    #[tokio::test]
    async fn test_send_command_ack_and_nak() {
        let (connector, mut sessions) = MockConnector::new();
        let client = Arc::new(TelnetClient::<Echo>::new("h", 1, connector, options()));
        let (state, session) = tokio::join!(client.connect(), async {
            let session = sessions.recv().await.unwrap();
            session.send(PRELUDE);
            session
        });
        assert!(state.is_connected());
        let mut session = session;
        let mut events = client.subscribe();

        let sending = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send_command("value", "VALUE:\n0 next\n\n".to_string(), |state, events| {
                        state.value = "next".to_string();
                        events.push("next".to_string());
                    })
                    .await
            })
        };
        assert_eq!(session.next_write().await, "VALUE:\n0 next\n\n");
        session.send("ACK\n\n");
        assert!(sending.await.unwrap().unwrap());
        assert_eq!(client.snapshot().value, "next");
        assert_eq!(events.recv().await.unwrap(), "next");

        let sending = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send_command("value", "VALUE:\n0 other\n\n".to_string(), |state, _| {
                        state.value = "other".to_string();
                    })
                    .await
            })
        };
        session.next_write().await;
        session.send("NAK\n\n");
        assert!(!sending.await.unwrap().unwrap());
        assert_eq!(client.snapshot().value, "next");
    }

    #[tokio::test]
    async fn test_missing_reply_times_out() {
        let (connector, mut sessions) = MockConnector::new();
        let client = TelnetClient::<Echo>::new("h", 1, connector, options());
        let (_, _session) = tokio::join!(client.connect(), async {
            let session = sessions.recv().await.unwrap();
            session.send(PRELUDE);
            session
        });

        let err = client
            .send_command("value", "VALUE:\n0 x\n\n".to_string(), |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_not_connected_command_is_dropped() {
        let (connector, _sessions) = MockConnector::new();
        let client = TelnetClient::<Echo>::new("h", 1, connector, options());
        let sent = client
            .send_command("value", "VALUE:\n0 x\n\n".to_string(), |_, _| {})
            .await
            .unwrap();
        assert!(!sent);
    }

    #[test_log::test(tokio::test)]
    async fn test_device_closing_the_connection() {
        let (connector, mut sessions) = MockConnector::new();
        let client = TelnetClient::<Echo>::new("h", 1, connector, options());
        let (_, session) = tokio::join!(client.connect(), async {
            let session = sessions.recv().await.unwrap();
            session.send(PRELUDE);
            session
        });
        let manager = client.connection_manager().clone();

        drop(session);
        let state = manager
            .wait_for(ConnectionState::NOT_CONNECTED, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert!(state.is_failure());
        assert!(!client.prelude_parsed());
    }

    #[tokio::test]
    async fn test_close_right_after_prelude_keeps_failure() {
        let (connector, mut sessions) = MockConnector::new();
        let client = TelnetClient::<Echo>::new("h", 1, connector, options());
        let manager = client.connection_manager().clone();

        let (_, ()) = tokio::join!(client.connect(), async {
            let session = sessions.recv().await.unwrap();
            session.send(PRELUDE);
            drop(session);
        });

        let state = manager
            .wait_for(ConnectionState::NOT_CONNECTED, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(state, ConnectionState::NOT_CONNECTED | ConnectionState::FAILURE);
        assert!(manager.failure_reason().unwrap().contains("lost"));
        assert!(manager.failure_error().is_some());
    }

    #[tokio::test]
    async fn test_property_locks_serialize() {
        let locks = PropertyLocks::default();
        let first = locks.acquire("input_labels").await;

        let mut waiter = tokio_test::task::spawn(locks.acquire("input_labels"));
        tokio_test::assert_pending!(waiter.poll());

        // Another property is independent
        let _other = locks.acquire("output_labels").await;

        drop(first);
        assert!(waiter.is_woken());
        let _guard = tokio_test::assert_ready!(waiter.poll());
    }

    #[test]
    fn test_options_from_config() {
        let config = ConnectionConfig {
            default_port: DEFAULT_PORT,
            prelude_timeout_ms: 2500,
            ack_timeout_ms: 750,
            mirror_poll_ms: 1000,
        };
        let options = ClientOptions::from(&config);
        assert_eq!(options.prelude_timeout, Duration::from_millis(2500));
        assert_eq!(options.ack_timeout, Duration::from_millis(750));
    }
}
