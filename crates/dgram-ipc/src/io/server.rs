//! Server I/O actor.
//!
//! Binds the socket path, then serves the receive loop, the send pipeline
//! (server-originated sends carry explicit destinations), per-peer heartbeat
//! tracking, and the self-probe that detects loss of the on-disk socket
//! entry.
//!
//! # Bind sequence
//!
//! 1. Remove a stale socket file at the path; a pre-existing file that is
//!    not a socket is preserved and bind fails.
//! 2. Bind, then `SO_RCVBUF = buffer_size + margin` so a payload of exactly
//!    `buffer_size` bytes fits alongside the kind tag.
//!
//! # Self-probe
//!
//! A bound datagram socket keeps working after its filesystem entry is
//! unlinked, so the server periodically connects a short-lived probe socket
//! to its own path and sends one probe datagram. Once the file is gone the
//! connect fails and the endpoint closes; the reconnect wrapper then
//! re-binds. The probe is a local of the probe routine — it is dropped on
//! this task before any close is initiated.

use std::io;
use std::os::unix::fs::FileTypeExt;
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
    dispatch_datagram, set_receive_buffer_size, Flow, IoCommand, IoEvent, IoHandle,
    RECEIVE_BUFFER_MARGIN,
};
use crate::dispatcher::{Dispatcher, Timer};
use crate::entry::{SendKind, SendQueue};
use crate::error::Error;
use crate::heartbeat::PeerTracker;

pub(crate) struct ServerIoConfig {
    pub path: PathBuf,
    pub buffer_size: usize,
    pub server_check_interval: Option<Duration>,
}

/// Spawns the server actor.
pub(crate) fn spawn(
    dispatcher: Dispatcher,
    config: ServerIoConfig,
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
    config: ServerIoConfig,
    queue: SendQueue,
    cmd_tx: mpsc::UnboundedSender<IoCommand>,
    cmd_rx: mpsc::UnboundedReceiver<IoCommand>,
    events: mpsc::UnboundedSender<IoEvent>,
) {
    let socket = match bind(&config) {
        Ok(socket) => socket,
        Err(err) => {
            debug!(path = %config.path.display(), error = %err, "server bind failed");
            let _ = events.send(IoEvent::BindFailed(err));
            return;
        }
    };

    info!(path = %config.path.display(), "server bound");
    let _ = events.send(IoEvent::Bound);

    let recv_buf = vec![0u8; config.buffer_size + RECEIVE_BUFFER_MARGIN];
    let mut actor = ServerActor {
        pipeline: SendPipeline::new(queue, dispatcher.clone(), events.clone()),
        server_check_timer: Timer::new(&dispatcher),
        config,
        socket,
        tracker: PeerTracker::new(),
        events,
        cmd_rx,
        recv_buf,
        backoff: Box::pin(tokio::time::sleep(Duration::ZERO)),
        backoff_armed: false,
        socket_ready: true,
    };

    actor.start_timer(&cmd_tx);
    actor.run_loop().await;
    actor.shutdown();
}

fn bind(config: &ServerIoConfig) -> Result<UnixDatagram, Error> {
    cleanup_stale_socket(&config.path)?;

    let std_socket = StdUnixDatagram::bind(&config.path)?;
    set_receive_buffer_size(&std_socket, config.buffer_size + RECEIVE_BUFFER_MARGIN)?;
    std_socket.set_nonblocking(true)?;

    Ok(UnixDatagram::from_std(std_socket)?)
}

/// Removes a stale socket file at `path`.
///
/// Only socket files are ever unlinked: a pre-existing regular file (or
/// directory, or anything else) is evidence the path belongs to someone
/// else, so it is preserved and the bind fails.
fn cleanup_stale_socket(path: &Path) -> Result<(), Error> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(Error::Io(err)),
    };

    if !metadata.file_type().is_socket() {
        return Err(Error::NotASocket(path.to_path_buf()));
    }

    std::fs::remove_file(path)?;
    debug!(path = %path.display(), "removed stale socket file");
    Ok(())
}

struct ServerActor {
    config: ServerIoConfig,
    socket: UnixDatagram,
    pipeline: SendPipeline,
    tracker: PeerTracker,
    events: mpsc::UnboundedSender<IoEvent>,
    cmd_rx: mpsc::UnboundedReceiver<IoCommand>,
    server_check_timer: Timer,
    recv_buf: Vec<u8>,
    backoff: Pin<Box<Sleep>>,
    backoff_armed: bool,
    socket_ready: bool,
}

impl ServerActor {
    fn start_timer(&mut self, cmd: &mpsc::UnboundedSender<IoCommand>) {
        if let Some(interval) = self.config.server_check_interval {
            let cmd = cmd.clone();
            self.server_check_timer.start(interval, move || {
                let _ = cmd.send(IoCommand::ServerCheck);
            });
        }
    }

    async fn run_loop(&mut self) {
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
            Some(IoCommand::ServerCheck) => self.probe().await,
            // Bound-file checks belong to bidirectional clients.
            Some(IoCommand::CheckClientSocket) => Flow::Continue,
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
            Err(err) => debug!(error = %err, "server receive error ignored"),
        }
    }

    /// Connects a short-lived probe socket to our own path. Failure means
    /// the socket file was removed out from under us.
    async fn probe(&mut self) -> Flow {
        match self.run_probe().await {
            Ok(()) => Flow::Continue,
            Err(err) => {
                warn!(
                    path = %self.config.path.display(),
                    error = %err,
                    "self-probe failed; socket file lost"
                );
                let _ = self
                    .events
                    .send(IoEvent::Error(Error::SocketFileLost(self.config.path.clone())));
                Flow::Close
            }
        }
    }

    async fn run_probe(&self) -> io::Result<()> {
        let probe = UnixDatagram::unbound()?;
        probe.connect(&self.config.path)?;
        probe.send(&[SendKind::ServerCheck.tag()]).await?;
        Ok(())
    }

    fn sweep(&mut self) {
        for peer in self.tracker.take_missed(Instant::now()) {
            let _ = self.events.send(IoEvent::DeadlineExceeded(peer));
        }
    }

    fn shutdown(&mut self) {
        self.socket_ready = false;
        self.server_check_timer.stop();
        self.tracker.clear();

        // We created the socket file at bind; it is ours to remove.
        let _ = std::fs::remove_file(&self.config.path);

        debug!(path = %self.config.path.display(), "server endpoint closed");
        let _ = self.events.send(IoEvent::Closed);
    }
}
