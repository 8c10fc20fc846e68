//! Reliable local IPC over Unix-domain datagram sockets.
//!
//! Datagram sockets have no connections, no liveness, and no framing. This
//! crate layers all three on top, making a connectionless transport behave
//! like a connected one:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │   Peer manager (verify + shared secret)  │  peer
//! ├──────────────────────────────────────────┤
//! │  Reconnect wrappers (Client / Server)    │  client, server
//! ├──────────────────────────────────────────┤
//! │  I/O actors: send pipeline, liveness,    │  io
//! │  heartbeat deadlines, socket watching    │
//! ├──────────────────────────────────────────┤
//! │  Framing: [kind: u8 | payload]           │  entry
//! ├──────────────────────────────────────────┤
//! │  AF_UNIX SOCK_DGRAM                      │
//! └──────────────────────────────────────────┘
//! ```
//!
//! # Module Overview
//!
//! - [`client`] / [`server`]: public endpoints with automatic reconnection
//! - [`dispatcher`]: the serialization context all callbacks run on
//! - [`error`]: the error taxonomy driving retry/drop/close decisions
//! - [`peer`]: handshake and shared-secret layer above a server
//! - [`Signal`]: typed event channels carrying endpoint signals
//! - [`SendEntry`] / [`SendQueue`]: outbound datagrams and their queue
//!
//! # Wire Format
//!
//! Every datagram is one tag byte followed by the payload:
//!
//! ```text
//! +-----------+----------------------+
//! | kind (u8) | payload (0..n bytes) |
//! +-----------+----------------------+
//! ```
//!
//! The tag distinguishes liveness probes (`ServerCheck`), heartbeats, user
//! data, and responses — and doubles as protection against the zero-byte
//! datagram sends that some kernels reject with `no_buffer_space` after a
//! sleep/wake cycle. Senders size `SO_SNDBUF` one byte beyond the payload
//! ceiling so the tag never costs capacity.
//!
//! # Concurrency Model
//!
//! Each endpoint owns one I/O task that exclusively mutates its socket,
//! timers, and queue head. User-visible callbacks all run on one
//! [`Dispatcher`] context, in enqueue order. Nothing is delivered twice and
//! nothing is delivered after an endpoint's final `closed`, except the
//! `processed` completion callbacks of entries drained at teardown.
//!
//! # Example
//!
//! ```no_run
//! # async fn example() {
//! use std::time::Duration;
//! use dgram_ipc::{Client, ClientConfig, Dispatcher, Server, ServerConfig};
//!
//! let dispatcher = Dispatcher::new();
//!
//! let server = Server::new(
//!     &dispatcher,
//!     ServerConfig::new("tmp/server.sock")
//!         .with_server_check_interval(Duration::from_millis(3000))
//!         .with_reconnect_interval(Duration::from_millis(1000)),
//! );
//! let echo = server.clone_sender();
//! server.received().connect(move |(payload, sender)| {
//!     if let Some(sender) = sender {
//!         echo.async_send(payload.clone(), sender);
//!     }
//! });
//! server.async_start();
//!
//! let client = Client::new(
//!     &dispatcher,
//!     ClientConfig::new("tmp/server.sock")
//!         .with_client_path("tmp/client.sock")
//!         .with_reconnect_interval(Duration::from_millis(1000)),
//! );
//! client.async_start();
//! client.async_send(b"hello");
//! # }
//! ```

pub mod client;
pub mod dispatcher;
mod entry;
pub mod error;
mod heartbeat;
mod io;
pub mod peer;
pub mod server;
mod signal;

pub use client::{Client, ClientConfig, ServerPathResolver};
pub use dispatcher::{Dispatcher, Timer};
pub use entry::{ProcessedCallback, SendEntry, SendKind, SendQueue};
pub use error::{Error, Result};
pub use peer::{PeerManager, PeerPayload, INVALID_SECRET_RESPONSE, SHARED_SECRET_LEN};
pub use server::{Server, ServerConfig, ServerSender};
pub use signal::Signal;

/// Default kernel socket buffer and framing ceiling (32 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
