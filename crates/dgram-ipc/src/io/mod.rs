//! I/O-domain internals shared by the client and server actors.
//!
//! Each endpoint runs exactly one I/O task that owns the socket, the send
//! pipeline state, and the liveness tracker. Everything user-visible leaves
//! this domain as an [`IoEvent`] consumed by the endpoint's reconnect
//! wrapper, which re-emits it as a signal on the dispatcher.

pub(crate) mod client;
pub(crate) mod pipeline;
pub(crate) mod server;

use std::io;
use std::os::unix::net::UnixDatagram as StdUnixDatagram;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::entry::SendKind;
use crate::error::Error;
use crate::heartbeat::{decode_deadline, PeerTracker};

/// Watchdog: a single send that takes longer than this closes the endpoint.
pub(crate) const SEND_DEADLINE: Duration = Duration::from_millis(5000);

/// Delay before retrying a send that hit `ENOBUFS`.
pub(crate) const NO_BUFFER_SPACE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// `ENOBUFS` retries tolerated before a stalled entry (zero progress) is
/// dropped.
pub(crate) const NO_BUFFER_SPACE_STALL_LIMIT: u32 = 10;

/// Absolute `ENOBUFS` retry ceiling for an entry that made partial progress.
pub(crate) const NO_BUFFER_SPACE_TOTAL_LIMIT: u32 = 100;

/// Extra receive capacity beyond the configured buffer size, so a payload of
/// exactly `buffer_size` bytes fits alongside the kind tag.
pub(crate) const RECEIVE_BUFFER_MARGIN: usize = 32;

/// Events an I/O actor reports to its reconnect wrapper.
#[derive(Debug)]
pub(crate) enum IoEvent {
    /// Client connect succeeded; carries the peer pid when credentials are
    /// available on this platform.
    Connected(Option<i32>),
    /// Client connect failed; the actor has exited.
    ConnectFailed(Error),
    /// Server bind succeeded.
    Bound,
    /// Server bind failed; the actor has exited.
    BindFailed(Error),
    /// The endpoint closed after having been ready; the actor has exited.
    Closed,
    /// A data datagram arrived: payload (tag stripped) and sender path.
    Received(Vec<u8>, Option<PathBuf>),
    /// A non-fatal or pre-close error to surface through `error_occurred`.
    Error(Error),
    /// A tracked peer missed its heartbeat deadline.
    DeadlineExceeded(PathBuf),
}

/// Commands a reconnect wrapper posts into an I/O actor.
#[derive(Debug)]
pub(crate) enum IoCommand {
    /// New entries were queued; run the send loop. Idempotent.
    Wake,
    /// A liveness-probe tick fired.
    ServerCheck,
    /// A bound-file check tick fired (bidirectional clients).
    CheckClientSocket,
    /// Tear the endpoint down.
    Close,
}

/// Wrapper-side handle to a spawned I/O actor.
pub(crate) struct IoHandle {
    pub cmd: mpsc::UnboundedSender<IoCommand>,
    pub events: mpsc::UnboundedReceiver<IoEvent>,
}

/// Control-flow verdict of one actor loop step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close,
}

/// Sets `SO_SNDBUF`, reserving one byte beyond the payload ceiling for the
/// kind tag.
pub(crate) fn set_send_buffer_size(socket: &StdUnixDatagram, bytes: usize) -> io::Result<()> {
    nix::sys::socket::setsockopt(socket, nix::sys::socket::sockopt::SndBuf, &bytes)
        .map_err(io::Error::from)
}

/// Sets `SO_RCVBUF` to the receive ceiling (buffer size plus margin).
pub(crate) fn set_receive_buffer_size(socket: &StdUnixDatagram, bytes: usize) -> io::Result<()> {
    nix::sys::socket::setsockopt(socket, nix::sys::socket::sockopt::RcvBuf, &bytes)
        .map_err(io::Error::from)
}

/// Reads the connected peer's pid from socket credentials.
///
/// Best effort: datagram sockets only expose credentials on some platforms,
/// so `None` is a normal outcome, not an error.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn peer_pid(socket: &StdUnixDatagram) -> Option<i32> {
    nix::sys::socket::getsockopt(socket, nix::sys::socket::sockopt::PeerCredentials)
        .ok()
        .map(|credentials| credentials.pid())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn peer_pid(_socket: &StdUnixDatagram) -> Option<i32> {
    None
}

/// Dispatches one inbound datagram: strips the kind tag, feeds the liveness
/// tracker, and forwards data payloads to the wrapper.
///
/// Probes never refresh liveness; every other kind does. Unknown tags are
/// discarded.
pub(crate) fn dispatch_datagram(
    buf: &[u8],
    sender: Option<PathBuf>,
    tracker: &mut PeerTracker,
    events: &mpsc::UnboundedSender<IoEvent>,
) {
    let Some((&tag, payload)) = buf.split_first() else {
        return;
    };

    match SendKind::from_tag(tag) {
        Some(SendKind::UserData | SendKind::Response) => {
            if let Some(path) = &sender {
                tracker.refresh(path, Instant::now());
            }
            let _ = events.send(IoEvent::Received(payload.to_vec(), sender));
        }
        Some(SendKind::Heartbeat) => {
            if let Some(path) = &sender {
                let now = Instant::now();
                match decode_deadline(payload) {
                    Some(deadline) => tracker.advertise(path, deadline, now),
                    None => tracker.refresh(path, now),
                }
            }
        }
        Some(SendKind::ServerCheck) | None => {}
    }
}
