//! Error types for datagram endpoints.
//!
//! Errors fall into the taxonomy the send pipeline acts on:
//!
//! - **Transient backpressure** ([`Error::NoBufferSpace`]): the connection is
//!   kept and the entry is retried with a bounded budget.
//! - **Per-message fatal** ([`Error::MessageTooLong`]): the entry is dropped,
//!   the connection is kept.
//! - **Connection fatal** (everything else, including
//!   [`Error::SendDeadlineExceeded`] and wrapped I/O errors): the endpoint
//!   closes and the reconnect wrapper takes over.
//!
//! Errors never cross the I/O task as panics or return values; they are
//! marshalled to the user through the `error_occurred`, `connect_failed`, and
//! `bind_failed` signals.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use nix::errno::Errno;
use thiserror::Error;

/// Result alias for fallible endpoint operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by datagram endpoints.
#[derive(Debug, Error)]
pub enum Error {
    /// The kernel reported `ENOBUFS` for a send.
    ///
    /// Reported through `error_occurred` only once the retry budget is
    /// exhausted and the entry is dropped.
    #[error("no buffer space available")]
    NoBufferSpace,

    /// The datagram exceeds what the peer's receive buffer can take
    /// (`EMSGSIZE`). The entry is dropped; the connection survives.
    #[error("message too long")]
    MessageTooLong,

    /// A single send did not complete within the watchdog deadline.
    ///
    /// Some kernels never complete a datagram send after the peer
    /// disappears; the watchdog converts that hang into a close.
    #[error("send did not complete within {0:?}")]
    SendDeadlineExceeded(Duration),

    /// The server socket path resolved to an empty string at connect time.
    #[error("socket file path is empty")]
    EmptySocketPath,

    /// The requested bind path exists and is not a socket.
    ///
    /// Pre-existing regular files are never unlinked; bind fails instead.
    #[error("{} exists and is not a socket", .0.display())]
    NotASocket(PathBuf),

    /// A socket file this endpoint depends on disappeared from disk.
    #[error("socket file {} disappeared", .0.display())]
    SocketFileLost(PathBuf),

    /// Any other I/O failure (connect, bind, send, receive).
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Classification of a failed send syscall, driving the pipeline's
/// retry/drop/close decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendErrorClass {
    /// `ENOBUFS`: keep the connection, retry the entry.
    NoBufferSpace,
    /// `EMSGSIZE`: keep the connection, drop the entry.
    MessageSize,
    /// Anything else: close the connection, keep the entry.
    Fatal,
}

/// Classifies a send error by its raw OS errno.
pub(crate) fn classify_send_error(err: &io::Error) -> SendErrorClass {
    match err.raw_os_error() {
        Some(code) if code == Errno::ENOBUFS as i32 => SendErrorClass::NoBufferSpace,
        Some(code) if code == Errno::EMSGSIZE as i32 => SendErrorClass::MessageSize,
        _ => SendErrorClass::Fatal,
    }
}
