//! Client I/O actor.
//!
//! One task per connection attempt: it opens and connects the socket, then
//! serves the send pipeline, the receive loop, the liveness timers, and the
//! heartbeat sweep until it is told to close or hits a fatal error. The
//! reconnect wrapper consumes its [`IoEvent`] stream and decides whether a
//! replacement actor gets spawned.
//!
//! # Connect sequence
//!
//! 1. Open the datagram socket, binding the return path first when one is
//!    configured (stale return-path files are ours and get replaced).
//! 2. `SO_SNDBUF = buffer_size + 1` — one spare byte for the kind tag.
//! 3. Connect to the resolved server path.
//! 4. Read peer credentials where the platform exposes them.
//!
//! Any failure reports `ConnectFailed` and ends the actor; retry policy
//! lives entirely in the wrapper.

use std::io;
use std::os::unix::net::UnixDatagram as StdUnixDatagram;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use tokio::net::UnixDatagram;
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn};

use super::pipeline::{SendCycleStatus, SendPipeline};
use super::{
    dispatch_datagram, peer_pid, set_send_buffer_size, Flow, IoCommand, IoEvent, IoHandle,
    RECEIVE_BUFFER_MARGIN,
};
use crate::dispatcher::{Dispatcher, Timer};
use crate::entry::{SendEntry, SendQueue};
use crate::error::Error;
use crate::heartbeat::PeerTracker;

pub(crate) struct ClientIoConfig {
    /// Server path, already resolved by the wrapper at connect time.
    pub server_path: PathBuf,
    /// Return path for bidirectional traffic.
    pub client_path: Option<PathBuf>,
    pub buffer_size: usize,
    pub server_check_interval: Option<Duration>,
    pub client_socket_check_interval: Option<Duration>,
    /// Deadline interval advertised to the server in heartbeats.
    pub next_heartbeat_deadline: Option<Duration>,
}

/// Spawns the client actor; the returned handle feeds commands in and
/// carries lifecycle events out.
pub(crate) fn spawn(
    dispatcher: Dispatcher,
    config: ClientIoConfig,
    queue: SendQueue,
) -> IoHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    tokio::spawn(run(dispatcher, config, queue, cmd_tx.clone(), cmd_rx, event_tx));

    IoHandle {
        cmd: cmd_tx,
        events: event_rx,
    }
}

async fn run(
    dispatcher: Dispatcher,
    config: ClientIoConfig,
    queue: SendQueue,
    cmd_tx: mpsc::UnboundedSender<IoCommand>,
    cmd_rx: mpsc::UnboundedReceiver<IoCommand>,
    events: mpsc::UnboundedSender<IoEvent>,
) {
    let (socket, pid) = match connect(&config) {
        Ok(connected) => connected,
        Err(err) => {
            debug!(
                server = %config.server_path.display(),
                error = %err,
                "client connect failed"
            );
            // A return path bound before the failure is ours to remove.
            if let Some(path) = &config.client_path {
                let _ = std::fs::remove_file(path);
            }
            let _ = events.send(IoEvent::ConnectFailed(err));
            return;
        }
    };

    info!(
        server = %config.server_path.display(),
        peer_pid = ?pid,
        "client connected"
    );
    let _ = events.send(IoEvent::Connected(pid));

    let recv_buf = vec![0u8; config.buffer_size + RECEIVE_BUFFER_MARGIN];
    let mut actor = ClientActor {
        pipeline: SendPipeline::new(queue.clone(), dispatcher.clone(), events.clone()),
        server_check_timer: Timer::new(&dispatcher),
        socket_check_timer: Timer::new(&dispatcher),
        config,
        socket,
        queue,
        tracker: PeerTracker::new(),
        events,
        cmd_rx,
        recv_buf,
        backoff: Box::pin(tokio::time::sleep(Duration::ZERO)),
        backoff_armed: false,
        socket_ready: true,
    };

    actor.start_timers(&cmd_tx);
    actor.run_loop().await;
    actor.shutdown();
}

/// Opens, configures, and connects the socket. Synchronous: every step is a
/// local operation on a datagram socket.
fn connect(config: &ClientIoConfig) -> Result<(UnixDatagram, Option<i32>), Error> {
    let std_socket = match &config.client_path {
        Some(path) => {
            let _ = std::fs::remove_file(path);
            StdUnixDatagram::bind(path)?
        }
        None => StdUnixDatagram::unbound()?,
    };

    set_send_buffer_size(&std_socket, config.buffer_size + 1)?;
    std_socket.connect(&config.server_path)?;
    std_socket.set_nonblocking(true)?;

    let pid = peer_pid(&std_socket);
    let socket = UnixDatagram::from_std(std_socket)?;
    Ok((socket, pid))
}

struct ClientActor {
    config: ClientIoConfig,
    socket: UnixDatagram,
    queue: SendQueue,
    pipeline: SendPipeline,
    tracker: PeerTracker,
    events: mpsc::UnboundedSender<IoEvent>,
    cmd_rx: mpsc::UnboundedReceiver<IoCommand>,
    server_check_timer: Timer,
    socket_check_timer: Timer,
    recv_buf: Vec<u8>,
    backoff: Pin<Box<Sleep>>,
    backoff_armed: bool,
    socket_ready: bool,
}

impl ClientActor {
    fn start_timers(&mut self, cmd: &mpsc::UnboundedSender<IoCommand>) {
        if let Some(interval) = self.config.server_check_interval {
            let cmd = cmd.clone();
            self.server_check_timer.start(interval, move || {
                let _ = cmd.send(IoCommand::ServerCheck);
            });
        }

        if self.config.client_path.is_some() {
            if let Some(interval) = self.config.client_socket_check_interval {
                let cmd = cmd.clone();
                self.socket_check_timer.start(interval, move || {
                    let _ = cmd.send(IoCommand::CheckClientSocket);
                });
            }
        }
    }

    async fn run_loop(&mut self) {
        // Entries queued before this connection existed flush first.
        if self.pump().await == Flow::Close {
            return;
        }

        loop {
            let sweep_at = self.tracker.next_wakeup();
            let flow = tokio::select! {
                cmd = self.cmd_rx.recv() => self.handle_command(cmd).await,
                _ = &mut self.backoff, if self.backoff_armed => {
                    self.backoff_armed = false;
                    self.pump().await
                }
                received = self.socket.recv_from(&mut self.recv_buf) => {
                    self.handle_recv(received);
                    Flow::Continue
                }
                _ = tokio::time::sleep_until(sweep_at.unwrap_or_else(Instant::now)),
                    if sweep_at.is_some() =>
                {
                    self.sweep();
                    Flow::Continue
                }
            };

            if flow == Flow::Close {
                return;
            }
        }
    }

    async fn handle_command(&mut self, cmd: Option<IoCommand>) -> Flow {
        match cmd {
            Some(IoCommand::Wake) => self.pump().await,
            Some(IoCommand::ServerCheck) => {
                self.queue.push_back(SendEntry::probe());
                if self.config.client_path.is_some() {
                    if let Some(deadline) = self.config.next_heartbeat_deadline {
                        self.queue.push_back(SendEntry::heartbeat(deadline));
                    }
                }
                self.pump().await
            }
            Some(IoCommand::CheckClientSocket) => self.check_client_socket(),
            Some(IoCommand::Close) | None => Flow::Close,
        }
    }

    async fn pump(&mut self) -> Flow {
        if !self.socket_ready {
            return Flow::Continue;
        }

        match self.pipeline.drive(&self.socket).await {
            SendCycleStatus::Idle => {
                self.backoff_armed = false;
                Flow::Continue
            }
            SendCycleStatus::Backoff(at) => {
                self.backoff.as_mut().reset(at);
                self.backoff_armed = true;
                Flow::Continue
            }
            SendCycleStatus::Fatal => Flow::Close,
        }
    }

    fn handle_recv(&mut self, received: io::Result<(usize, tokio::net::unix::SocketAddr)>) {
        match received {
            Ok((n, addr)) => {
                let sender = addr.as_pathname().map(Path::to_path_buf);
                dispatch_datagram(&self.recv_buf[..n], sender, &mut self.tracker, &self.events);
            }
            // Receive errors carry no retry obligation; server loss surfaces
            // through the probe send instead.
            Err(err) => debug!(error = %err, "client receive error ignored"),
        }
    }

    /// Verifies the bound return path still exists on disk.
    fn check_client_socket(&mut self) -> Flow {
        let Some(path) = &self.config.client_path else {
            return Flow::Continue;
        };
        if path.exists() {
            return Flow::Continue;
        }

        warn!(path = %path.display(), "client socket file disappeared");
        let _ = self
            .events
            .send(IoEvent::Error(Error::SocketFileLost(path.clone())));
        Flow::Close
    }

    fn sweep(&mut self) {
        for peer in self.tracker.take_missed(Instant::now()) {
            let _ = self.events.send(IoEvent::DeadlineExceeded(peer));
        }
    }

    fn shutdown(&mut self) {
        self.socket_ready = false;
        self.server_check_timer.stop();
        self.socket_check_timer.stop();
        self.tracker.clear();

        if let Some(path) = &self.config.client_path {
            let _ = std::fs::remove_file(path);
        }

        debug!(server = %self.config.server_path.display(), "client endpoint closed");
        let _ = self.events.send(IoEvent::Closed);
    }
}
