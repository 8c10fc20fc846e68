//! Public server endpoint with automatic re-bind.
//!
//! [`Server`] mirrors the client wrapper: it owns the current inner I/O
//! actor, re-binds after `bind_failed` or `closed` when a reconnect interval
//! is configured, and forwards every inner event as a dispatcher-side
//! signal. The shared send queue keeps server-originated replies alive
//! across a re-bind.
//!
//! ```no_run
//! # async fn example() {
//! use std::time::Duration;
//! use dgram_ipc::{Dispatcher, Server, ServerConfig};
//!
//! let dispatcher = Dispatcher::new();
//! let server = Server::new(
//!     &dispatcher,
//!     ServerConfig::new("/tmp/server.sock")
//!         .with_server_check_interval(Duration::from_millis(3000))
//!         .with_reconnect_interval(Duration::from_millis(1000)),
//! );
//!
//! server.received().connect({
//!     let echo = server.clone_sender();
//!     move |(payload, sender)| {
//!         if let Some(sender) = sender {
//!             echo.async_send(payload.clone(), sender);
//!         }
//!     }
//! });
//!
//! server.async_start();
//! # }
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::dispatcher::Dispatcher;
use crate::entry::{SendEntry, SendKind, SendQueue};
use crate::error::Error;
use crate::io::server::{spawn as spawn_io, ServerIoConfig};
use crate::io::{IoCommand, IoEvent, IoHandle};
use crate::signal::Signal;
use crate::DEFAULT_BUFFER_SIZE;

/// Server construction parameters.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    path: PathBuf,
    buffer_size: usize,
    server_check_interval: Option<Duration>,
    reconnect_interval: Option<Duration>,
}

impl ServerConfig {
    /// Creates a config binding `path` with the default buffer size and no
    /// timers or re-bind.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            server_check_interval: None,
            reconnect_interval: None,
        }
    }

    /// Kernel socket buffer and framing ceiling.
    #[must_use]
    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    /// Period of the self-probe that detects loss of the on-disk socket
    /// entry.
    #[must_use]
    pub fn with_server_check_interval(mut self, interval: Duration) -> Self {
        self.server_check_interval = Some(interval);
        self
    }

    /// Delay between bind attempts. Without it the server gives up after
    /// the first failure or close.
    #[must_use]
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = Some(interval);
        self
    }
}

struct ServerSignals {
    bound: Signal<()>,
    bind_failed: Signal<Error>,
    closed: Signal<()>,
    received: Signal<(Vec<u8>, Option<PathBuf>)>,
    error_occurred: Signal<Error>,
    next_heartbeat_deadline_exceeded: Signal<PathBuf>,
}

impl ServerSignals {
    fn new(dispatcher: &Dispatcher) -> Self {
        Self {
            bound: Signal::new(dispatcher.clone()),
            bind_failed: Signal::new(dispatcher.clone()),
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

/// A re-binding Unix-domain datagram server.
pub struct Server {
    signals: Arc<ServerSignals>,
    ctl: mpsc::UnboundedSender<Ctl>,
    /// Held only by this handle; its drop tells the supervisor to finish.
    _alive: mpsc::UnboundedSender<()>,
}

/// Lightweight sending handle, detached from the server's lifecycle so
/// subscriber closures can reply without owning the server.
#[derive(Clone)]
pub struct ServerSender {
    ctl: mpsc::UnboundedSender<Ctl>,
}

impl ServerSender {
    /// Queues a datagram addressed to `destination`.
    pub fn async_send(&self, payload: impl AsRef<[u8]>, destination: impl Into<PathBuf>) {
        submit(
            &self.ctl,
            SendEntry::new(SendKind::UserData, payload.as_ref()).with_destination(destination),
        );
    }
}

impl fmt::Debug for ServerSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSender").finish_non_exhaustive()
    }
}

impl Server {
    /// Creates the server and its supervisor. Must be called inside a tokio
    /// runtime; nothing touches the filesystem until [`Server::async_start`].
    #[must_use]
    pub fn new(dispatcher: &Dispatcher, config: ServerConfig) -> Self {
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (alive_tx, alive_rx) = mpsc::unbounded_channel();
        let signals = Arc::new(ServerSignals::new(dispatcher));

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

    /// Begins binding; enables re-bind on failure.
    pub fn async_start(&self) {
        let _ = self.ctl.send(Ctl::Start);
    }

    /// Stops the endpoint; re-bind is disabled before the inner endpoint
    /// emits `closed`.
    pub fn async_stop(&self) {
        let _ = self.ctl.send(Ctl::Stop);
    }

    /// Queues a datagram addressed to `destination` (typically the sender
    /// path of a received datagram).
    pub fn async_send(&self, payload: impl AsRef<[u8]>, destination: impl Into<PathBuf>) {
        submit(
            &self.ctl,
            SendEntry::new(SendKind::UserData, payload.as_ref()).with_destination(destination),
        );
    }

    /// [`Server::async_send`] with a completion callback, invoked exactly
    /// once on the dispatcher when the entry leaves the queue.
    pub fn async_send_with(
        &self,
        payload: impl AsRef<[u8]>,
        destination: impl Into<PathBuf>,
        processed: impl FnOnce() + Send + 'static,
    ) {
        submit(
            &self.ctl,
            SendEntry::new(SendKind::UserData, payload.as_ref())
                .with_destination(destination)
                .with_processed(processed),
        );
    }

    /// A detached sending handle for subscriber closures.
    #[must_use]
    pub fn clone_sender(&self) -> ServerSender {
        ServerSender {
            ctl: self.ctl.clone(),
        }
    }

    /// Fired once per successful bind.
    #[must_use]
    pub fn bound(&self) -> &Signal<()> {
        &self.signals.bound
    }

    /// Fired when a bind attempt fails, including when the path is occupied
    /// by a pre-existing non-socket file.
    #[must_use]
    pub fn bind_failed(&self) -> &Signal<Error> {
        &self.signals.bind_failed
    }

    /// Fired when a previously bound endpoint closes.
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

    /// Fired for send-pipeline errors and immediately before fatal closes.
    #[must_use]
    pub fn error_occurred(&self) -> &Signal<Error> {
        &self.signals.error_occurred
    }

    /// Fired when a peer that advertised a heartbeat deadline goes quiet
    /// past it, once per lapse.
    #[must_use]
    pub fn next_heartbeat_deadline_exceeded(&self) -> &Signal<PathBuf> {
        &self.signals.next_heartbeat_deadline_exceeded
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

fn submit(ctl: &mpsc::UnboundedSender<Ctl>, entry: SendEntry) {
    if let Err(mpsc::error::SendError(Ctl::Send(mut entry))) = ctl.send(Ctl::Send(entry)) {
        // Supervisor already gone; honor the completion contract here.
        if let Some(processed) = entry.take_processed() {
            processed();
        }
    }
}

struct Supervisor {
    dispatcher: Dispatcher,
    config: ServerConfig,
    queue: SendQueue,
    signals: Arc<ServerSignals>,
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
                self.bind();
            }
            Ctl::Stop => {
                // Order matters: disable re-bind before the inner endpoint
                // emits `closed`.
                self.reconnect_enabled = false;
                self.stopped = true;
                self.teardown_inner().await;
            }
            Ctl::Send(entry) => self.route_send(entry),
            Ctl::Reconnect => {
                if self.reconnect_enabled && self.inner.is_none() {
                    self.bind();
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
            IoEvent::Bound => self.signals.bound.emit(()),
            IoEvent::BindFailed(err) => self.signals.bind_failed.emit(err),
            IoEvent::Closed => self.signals.closed.emit(()),
            IoEvent::Received(payload, sender) => self.signals.received.emit((payload, sender)),
            IoEvent::Error(err) => self.signals.error_occurred.emit(err),
            IoEvent::DeadlineExceeded(peer) => {
                self.signals.next_heartbeat_deadline_exceeded.emit(peer);
            }
            // Client-side events never originate from a server actor.
            IoEvent::Connected(_) | IoEvent::ConnectFailed(_) => {}
        }
    }

    fn bind(&mut self) {
        if self.inner.is_some() {
            return;
        }

        let io_config = ServerIoConfig {
            path: self.config.path.clone(),
            buffer_size: self.config.buffer_size,
            server_check_interval: self.config.server_check_interval,
        };
        self.inner = Some(spawn_io(
            self.dispatcher.clone(),
            io_config,
            self.queue.clone(),
        ));
    }

    fn route_send(&mut self, mut entry: SendEntry) {
        if self.stopped {
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
