//! Public client endpoint with automatic reconnection.
//!
//! [`Client`] is the outer lifecycle manager: it owns the current inner I/O
//! actor, restarts it after `connect_failed` or `closed` when a reconnect
//! interval is configured, forwards every inner event as a dispatcher-side
//! signal, and resolves dynamic server paths at each connect attempt.
//!
//! Pending sends live in a queue shared with whichever inner actor is
//! currently alive, so datagrams submitted while the server is down are
//! flushed after the next successful connect.
//!
//! ```no_run
//! # async fn example() {
//! use std::time::Duration;
//! use dgram_ipc::{Client, ClientConfig, Dispatcher};
//!
//! let dispatcher = Dispatcher::new();
//! let client = Client::new(
//!     &dispatcher,
//!     ClientConfig::new("/tmp/server.sock")
//!         .with_client_path("/tmp/client.sock")
//!         .with_server_check_interval(Duration::from_millis(3000))
//!         .with_reconnect_interval(Duration::from_millis(1000)),
//! );
//!
//! client.connected().connect(|peer_pid| {
//!     println!("connected, peer pid: {peer_pid:?}");
//! });
//! client.received().connect(|(payload, _sender)| {
//!     println!("received {} bytes", payload.len());
//! });
//!
//! client.async_start();
//! client.async_send(b"hello".to_vec());
//! # }
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::dispatcher::Dispatcher;
use crate::entry::{SendEntry, SendKind, SendQueue};
use crate::error::Error;
use crate::io::client::{spawn as spawn_io, ClientIoConfig};
use crate::io::{IoCommand, IoEvent, IoHandle};
use crate::signal::Signal;
use crate::DEFAULT_BUFFER_SIZE;

/// Callable producing the effective server path at connect time.
pub type ServerPathResolver = Arc<dyn Fn() -> PathBuf + Send + Sync>;

/// Client construction parameters.
#[derive(Clone)]
pub struct ClientConfig {
    server_path: PathBuf,
    client_path: Option<PathBuf>,
    buffer_size: usize,
    server_check_interval: Option<Duration>,
    client_socket_check_interval: Option<Duration>,
    next_heartbeat_deadline: Option<Duration>,
    reconnect_interval: Option<Duration>,
    server_path_resolver: Option<ServerPathResolver>,
}

impl ClientConfig {
    /// Creates a config targeting `server_path` with the default buffer
    /// size and no timers or reconnect.
    #[must_use]
    pub fn new(server_path: impl Into<PathBuf>) -> Self {
        Self {
            server_path: server_path.into(),
            client_path: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            server_check_interval: None,
            client_socket_check_interval: None,
            next_heartbeat_deadline: None,
            reconnect_interval: None,
            server_path_resolver: None,
        }
    }

    /// Binds a return path so the server can address this client
    /// (bidirectional traffic, heartbeats, peer-manager handshakes).
    #[must_use]
    pub fn with_client_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_path = Some(path.into());
        self
    }

    /// Kernel socket buffer and framing ceiling.
    #[must_use]
    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    /// Period of the liveness probe towards the server.
    #[must_use]
    pub fn with_server_check_interval(mut self, interval: Duration) -> Self {
        self.server_check_interval = Some(interval);
        self
    }

    /// Period of the check that the bound return path still exists.
    #[must_use]
    pub fn with_client_socket_check_interval(mut self, interval: Duration) -> Self {
        self.client_socket_check_interval = Some(interval);
        self
    }

    /// Deadline interval advertised to the server; after this long without a
    /// datagram from us the server reports the deadline exceeded.
    #[must_use]
    pub fn with_next_heartbeat_deadline(mut self, deadline: Duration) -> Self {
        self.next_heartbeat_deadline = Some(deadline);
        self
    }

    /// Delay between connect attempts. Without it the client gives up after
    /// the first failure or close.
    #[must_use]
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = Some(interval);
        self
    }

    /// Re-resolves the server path at every connect attempt, enabling
    /// socket-path rotation.
    #[must_use]
    pub fn with_server_path_resolver(
        mut self,
        resolver: impl Fn() -> PathBuf + Send + Sync + 'static,
    ) -> Self {
        self.server_path_resolver = Some(Arc::new(resolver));
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server_path", &self.server_path)
            .field("client_path", &self.client_path)
            .field("buffer_size", &self.buffer_size)
            .field("server_check_interval", &self.server_check_interval)
            .field(
                "client_socket_check_interval",
                &self.client_socket_check_interval,
            )
            .field("next_heartbeat_deadline", &self.next_heartbeat_deadline)
            .field("reconnect_interval", &self.reconnect_interval)
            .field("has_resolver", &self.server_path_resolver.is_some())
            .finish()
    }
}

struct ClientSignals {
    connected: Signal<Option<i32>>,
    connect_failed: Signal<Error>,
    closed: Signal<()>,
    received: Signal<(Vec<u8>, Option<PathBuf>)>,
    error_occurred: Signal<Error>,
    next_heartbeat_deadline_exceeded: Signal<PathBuf>,
}

impl ClientSignals {
    fn new(dispatcher: &Dispatcher) -> Self {
        Self {
            connected: Signal::new(dispatcher.clone()),
            connect_failed: Signal::new(dispatcher.clone()),
            closed: Signal::new(dispatcher.clone()),
            received: Signal::new(dispatcher.clone()),
            error_occurred: Signal::new(dispatcher.clone()),
            next_heartbeat_deadline_exceeded: Signal::new(dispatcher.clone()),
        }
    }
}

enum Ctl {
    Start,
    Stop,
    Send(SendEntry),
    Reconnect,
}

/// A reconnecting Unix-domain datagram client.
///
/// Dropping the handle tears the endpoint down; every still-queued entry has
/// its `processed` callback invoked once during the drain.
pub struct Client {
    signals: Arc<ClientSignals>,
    ctl: mpsc::UnboundedSender<Ctl>,
    /// Held only by this handle; its drop tells the supervisor to finish.
    _alive: mpsc::UnboundedSender<()>,
}

impl Client {
    /// Creates the client and its supervisor. Must be called inside a tokio
    /// runtime; nothing touches the filesystem until [`Client::async_start`].
    #[must_use]
    pub fn new(dispatcher: &Dispatcher, config: ClientConfig) -> Self {
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (alive_tx, alive_rx) = mpsc::unbounded_channel();
        let signals = Arc::new(ClientSignals::new(dispatcher));

        let supervisor = Supervisor {
            dispatcher: dispatcher.clone(),
            config,
            queue: SendQueue::new(),
            signals: Arc::clone(&signals),
            ctl_tx: ctl_tx.clone(),
            ctl_rx,
            alive_rx,
            inner: None,
            reconnect_enabled: false,
            stopped: false,
        };
        tokio::spawn(supervisor.run());

        Self {
            signals,
            ctl: ctl_tx,
            _alive: alive_tx,
        }
    }

    /// Begins connecting; enables reconnection.
    pub fn async_start(&self) {
        let _ = self.ctl.send(Ctl::Start);
    }

    /// Stops the endpoint. Reconnection is disabled before the inner
    /// endpoint closes, so the resulting `closed` cannot reschedule.
    pub fn async_stop(&self) {
        let _ = self.ctl.send(Ctl::Stop);
    }

    /// Queues a datagram. While the server is unreachable the entry waits in
    /// the shared queue and is flushed after the next connect; after
    /// [`Client::async_stop`] the entry is dropped (its `processed` callback
    /// still runs).
    pub fn async_send(&self, payload: impl AsRef<[u8]>) {
        self.submit(SendEntry::new(SendKind::UserData, payload.as_ref()));
    }

    /// [`Client::async_send`] with a completion callback, invoked exactly
    /// once on the dispatcher when the entry leaves the queue.
    pub fn async_send_with(
        &self,
        payload: impl AsRef<[u8]>,
        processed: impl FnOnce() + Send + 'static,
    ) {
        self.submit(SendEntry::new(SendKind::UserData, payload.as_ref()).with_processed(processed));
    }

    fn submit(&self, entry: SendEntry) {
        if let Err(mpsc::error::SendError(Ctl::Send(mut entry))) = self.ctl.send(Ctl::Send(entry)) {
            // Supervisor already gone; honor the completion contract here.
            if let Some(processed) = entry.take_processed() {
                processed();
            }
        }
    }

    /// Fired once per successful connect, with the server pid when the
    /// platform exposes socket credentials.
    #[must_use]
    pub fn connected(&self) -> &Signal<Option<i32>> {
        &self.signals.connected
    }

    /// Fired when a connect attempt fails.
    #[must_use]
    pub fn connect_failed(&self) -> &Signal<Error> {
        &self.signals.connect_failed
    }

    /// Fired when a previously connected endpoint closes.
    #[must_use]
    pub fn closed(&self) -> &Signal<()> {
        &self.signals.closed
    }

    /// Fired per inbound data datagram: payload (kind tag stripped) and
    /// sender path, when the sender bound one.
    #[must_use]
    pub fn received(&self) -> &Signal<(Vec<u8>, Option<PathBuf>)> {
        &self.signals.received
    }

    /// Fired for send-pipeline errors that do not abort the connection, and
    /// immediately before fatal closes.
    #[must_use]
    pub fn error_occurred(&self) -> &Signal<Error> {
        &self.signals.error_occurred
    }

    /// Fired when a peer that advertised a heartbeat deadline goes quiet
    /// past it.
    #[must_use]
    pub fn next_heartbeat_deadline_exceeded(&self) -> &Signal<PathBuf> {
        &self.signals.next_heartbeat_deadline_exceeded
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

struct Supervisor {
    dispatcher: Dispatcher,
    config: ClientConfig,
    queue: SendQueue,
    signals: Arc<ClientSignals>,
    ctl_tx: mpsc::UnboundedSender<Ctl>,
    ctl_rx: mpsc::UnboundedReceiver<Ctl>,
    /// Resolves (to `None`) only when the public handle is dropped.
    alive_rx: mpsc::UnboundedReceiver<()>,
    inner: Option<IoHandle>,
    reconnect_enabled: bool,
    stopped: bool,
}

enum Step {
    Ctl(Option<Ctl>),
    Inner(Option<IoEvent>),
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            let step = tokio::select! {
                ctl = self.ctl_rx.recv() => Step::Ctl(ctl),
                event = next_event(&mut self.inner) => Step::Inner(event),
                _ = self.alive_rx.recv() => Step::Ctl(None),
            };

            match step {
                Step::Ctl(None) => break,
                Step::Ctl(Some(ctl)) => self.handle_ctl(ctl).await,
                Step::Inner(event) => self.handle_inner(event),
            }
        }

        // Handle dropped: tear down and honor the completion contract for
        // everything still queued, including sends that never left the
        // control channel.
        self.reconnect_enabled = false;
        self.teardown_inner().await;
        while let Ok(ctl) = self.ctl_rx.try_recv() {
            if let Ctl::Send(mut entry) = ctl {
                if let Some(processed) = entry.take_processed() {
                    self.dispatcher.enqueue(processed);
                }
            }
        }
        for mut entry in self.queue.drain() {
            if let Some(processed) = entry.take_processed() {
                self.dispatcher.enqueue(processed);
            }
        }
    }

    async fn handle_ctl(&mut self, ctl: Ctl) {
        match ctl {
            Ctl::Start => {
                self.reconnect_enabled = true;
                self.stopped = false;
                self.connect();
            }
            Ctl::Stop => {
                // Order matters: disable reconnect before the inner endpoint
                // emits `closed`.
                self.reconnect_enabled = false;
                self.stopped = true;
                self.teardown_inner().await;
            }
            Ctl::Send(entry) => self.route_send(entry),
            Ctl::Reconnect => {
                if self.reconnect_enabled && self.inner.is_none() {
                    self.connect();
                }
            }
        }
    }

    fn handle_inner(&mut self, event: Option<IoEvent>) {
        let Some(event) = event else {
            self.inner = None;
            return;
        };

        let terminal = matches!(
            event,
            IoEvent::ConnectFailed(_) | IoEvent::BindFailed(_) | IoEvent::Closed
        );
        self.emit(event);
        if terminal {
            self.inner = None;
            self.schedule_reconnect();
        }
    }

    fn emit(&self, event: IoEvent) {
        match event {
            IoEvent::Connected(pid) => self.signals.connected.emit(pid),
            IoEvent::ConnectFailed(err) => self.signals.connect_failed.emit(err),
            IoEvent::Closed => self.signals.closed.emit(()),
            IoEvent::Received(payload, sender) => self.signals.received.emit((payload, sender)),
            IoEvent::Error(err) => self.signals.error_occurred.emit(err),
            IoEvent::DeadlineExceeded(peer) => {
                self.signals.next_heartbeat_deadline_exceeded.emit(peer);
            }
            // Server-side events never originate from a client actor.
            IoEvent::Bound | IoEvent::BindFailed(_) => {}
        }
    }

    fn connect(&mut self) {
        if self.inner.is_some() {
            return;
        }

        let server_path = match &self.config.server_path_resolver {
            Some(resolver) => resolver(),
            None => self.config.server_path.clone(),
        };
        if server_path.as_os_str().is_empty() {
            debug!("server path resolved empty");
            self.signals.connect_failed.emit(Error::EmptySocketPath);
            self.schedule_reconnect();
            return;
        }

        let io_config = ClientIoConfig {
            server_path,
            client_path: self.config.client_path.clone(),
            buffer_size: self.config.buffer_size,
            server_check_interval: self.config.server_check_interval,
            client_socket_check_interval: self.config.client_socket_check_interval,
            next_heartbeat_deadline: self.config.next_heartbeat_deadline,
        };
        self.inner = Some(spawn_io(
            self.dispatcher.clone(),
            io_config,
            self.queue.clone(),
        ));
    }

    fn route_send(&mut self, mut entry: SendEntry) {
        if self.stopped {
            // Inert send; the completion contract still holds.
            if let Some(processed) = entry.take_processed() {
                self.dispatcher.enqueue(processed);
            }
            return;
        }

        self.queue.push_back(entry);
        if let Some(inner) = &self.inner {
            let _ = inner.cmd.send(IoCommand::Wake);
        }
    }

    fn schedule_reconnect(&self) {
        if !self.reconnect_enabled {
            return;
        }
        let Some(interval) = self.config.reconnect_interval else {
            return;
        };

        let ctl = self.ctl_tx.clone();
        self.dispatcher.enqueue_at(
            move || {
                let _ = ctl.send(Ctl::Reconnect);
            },
            self.dispatcher.when_now() + interval,
        );
    }

    /// Closes the inner endpoint and forwards its remaining events,
    /// including the final `closed`.
    async fn teardown_inner(&mut self) {
        let Some(mut inner) = self.inner.take() else {
            return;
        };
        let _ = inner.cmd.send(IoCommand::Close);
        while let Some(event) = inner.events.recv().await {
            self.emit(event);
        }
    }
}

async fn next_event(inner: &mut Option<IoHandle>) -> Option<IoEvent> {
    match inner {
        Some(handle) => handle.events.recv().await,
        None => std::future::pending().await,
    }
}
