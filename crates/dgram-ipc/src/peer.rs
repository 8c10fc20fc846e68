//! Peer verification and shared-secret exchange.
//!
//! [`PeerManager`] turns a connectionless server socket into a verified
//! channel without a real session. It pairs with a [`Server`], watches its
//! `received` signal for JSON payloads, and runs the handshake protocol:
//!
//! ```text
//! Client                                        Server + PeerManager
//!   |                                                  |
//!   |  -- {"type":"handshake"} ------------------->    |  verifier(pid, path)
//!   |                                                  |  generate 32 random bytes
//!   |  <-- {"type":"shared_secret","secret":[...]} --  |
//!   |                                                  |
//!   |  -- {"type":"message","message":..,"secret":[...]} ->  constant-time check
//!   |  <-- {"type":"message_response", ...} ---------  |
//! ```
//!
//! The secret is per-peer-path and never reused across peers. The verifier
//! runs before secret issuance — without it, anyone able to send a datagram
//! could obtain a valid secret — and is the integration point for credential
//! checks (uid, pid, or stricter policy). This layer does not trust the
//! verifier's implementation with anything beyond the accept/reject call.
//!
//! The shared secret is an authentication token, not a session key: payloads
//! stay in the clear.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::client::{Client, ClientConfig};
use crate::dispatcher::Dispatcher;
use crate::server::Server;

/// Length of an issued shared secret, in bytes.
pub const SHARED_SECRET_LEN: usize = 32;

/// Response text returned when a message carries a wrong or unknown secret.
pub const INVALID_SECRET_RESPONSE: &str = "invalid secret";

/// Wire payloads of the peer protocol, carried as `UserData` datagrams.
///
/// Byte fields serialize as JSON arrays of integers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerPayload {
    /// Client requests a secret.
    Handshake,
    /// Server issues a fresh per-peer secret.
    SharedSecret { secret: Vec<u8> },
    /// Client message authenticated by the echoed secret.
    Message { message: String, secret: Vec<u8> },
    /// Server reply to a message.
    MessageResponse { message_response: String },
}

type Verifier = Box<dyn Fn(Option<i32>, &Path) -> bool + Send + Sync>;
type MessageHandler = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Server-side handshake and authenticated-send layer.
pub struct PeerManager {
    inner: Arc<PeerManagerInner>,
}

struct PeerManagerInner {
    dispatcher: Dispatcher,
    buffer_size: usize,
    verifier: Verifier,
    message_handler: Mutex<Option<MessageHandler>>,
    shared_secrets: Mutex<HashMap<PathBuf, Vec<u8>>>,
    reply_clients: Mutex<HashMap<PathBuf, Client>>,
}

impl PeerManager {
    /// Creates a peer manager.
    ///
    /// `buffer_size` sizes the outbound reply clients and should match the
    /// peers' receive ceiling. `verifier` gates secret issuance by peer
    /// credentials; the pid argument is `None` when the platform does not
    /// expose datagram peer credentials to the server.
    #[must_use]
    pub fn new(
        dispatcher: &Dispatcher,
        buffer_size: usize,
        verifier: impl Fn(Option<i32>, &Path) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(PeerManagerInner {
                dispatcher: dispatcher.clone(),
                buffer_size,
                verifier: Box::new(verifier),
                message_handler: Mutex::new(None),
                shared_secrets: Mutex::new(HashMap::new()),
                reply_clients: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Installs the application handler for verified messages. Without one,
    /// verified messages are dropped (failed verification still answers
    /// [`INVALID_SECRET_RESPONSE`]).
    pub fn set_message_handler(&self, handler: impl Fn(&str) -> String + Send + Sync + 'static) {
        *lock(&self.inner.message_handler) = Some(Box::new(handler));
    }

    /// Subscribes this manager to a server's `received` signal. Datagrams
    /// without a sender path are ignored — there is nowhere to reply.
    pub fn attach(&self, server: &Server) {
        let inner = Arc::clone(&self.inner);
        server.received().connect(move |event| {
            let (payload, sender) = event;
            let Some(sender) = sender else {
                return;
            };
            PeerManagerInner::handle_datagram(&inner, payload, sender, None);
        });
    }

    /// Feeds one datagram through the protocol. Exposed for servers that
    /// multiplex their `received` signal themselves.
    pub fn handle_datagram(&self, payload: &[u8], sender: &Path, peer_pid: Option<i32>) {
        PeerManagerInner::handle_datagram(&self.inner, payload, sender, peer_pid);
    }

    /// Stores `secret` for `peer`, replacing any previous one.
    pub fn insert_shared_secret(&self, peer: impl Into<PathBuf>, secret: Vec<u8>) {
        lock(&self.inner.shared_secrets).insert(peer.into(), secret);
    }

    /// Constant-time comparison of `candidate` against the stored secret.
    /// Unknown peers never verify.
    #[must_use]
    pub fn verify_shared_secret(&self, peer: &Path, candidate: &[u8]) -> bool {
        match lock(&self.inner.shared_secrets).get(peer) {
            Some(stored) => stored.as_slice().ct_eq(candidate).into(),
            None => false,
        }
    }

    /// Queues `payload` to `peer` through the manager's cached reply client
    /// for that path.
    pub fn async_send(&self, peer: &Path, payload: impl AsRef<[u8]>) {
        PeerManagerInner::send_bytes(&self.inner, peer, payload.as_ref().to_vec());
    }
}

impl fmt::Debug for PeerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerManager")
            .field("peers", &lock(&self.inner.shared_secrets).len())
            .finish_non_exhaustive()
    }
}

impl PeerManagerInner {
    fn handle_datagram(inner: &Arc<Self>, payload: &[u8], sender: &Path, peer_pid: Option<i32>) {
        let payload: PeerPayload = match serde_json::from_slice(payload) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(sender = %sender.display(), error = %err, "ignoring non-protocol datagram");
                return;
            }
        };

        match payload {
            PeerPayload::Handshake => {
                if !(inner.verifier)(peer_pid, sender) {
                    warn!(sender = %sender.display(), "peer verification rejected handshake");
                    return;
                }

                let mut secret = vec![0u8; SHARED_SECRET_LEN];
                OsRng.fill_bytes(&mut secret);
                lock(&inner.shared_secrets).insert(sender.to_path_buf(), secret.clone());
                debug!(sender = %sender.display(), "issued shared secret");

                Self::reply(inner, sender, &PeerPayload::SharedSecret { secret });
            }
            PeerPayload::Message { message, secret } => {
                let verified = match lock(&inner.shared_secrets).get(sender) {
                    Some(stored) => bool::from(stored.as_slice().ct_eq(&secret)),
                    None => false,
                };

                let message_response = if verified {
                    let handler = lock(&inner.message_handler);
                    match handler.as_ref() {
                        Some(handler) => handler(&message),
                        None => return,
                    }
                } else {
                    INVALID_SECRET_RESPONSE.to_string()
                };

                Self::reply(inner, sender, &PeerPayload::MessageResponse { message_response });
            }
            // Server-to-client payloads arriving at the server are stray.
            PeerPayload::SharedSecret { .. } | PeerPayload::MessageResponse { .. } => {
                debug!(sender = %sender.display(), "ignoring reply payload on server side");
            }
        }
    }

    fn reply(inner: &Arc<Self>, peer: &Path, payload: &PeerPayload) {
        match serde_json::to_vec(payload) {
            Ok(bytes) => Self::send_bytes(inner, peer, bytes),
            Err(err) => debug!(error = %err, "failed to serialize peer payload"),
        }
    }

    /// Sends through a cached per-peer client, creating it on first use.
    /// The cache entry evicts itself when its client closes, so a peer that
    /// reappears later gets a fresh connection.
    fn send_bytes(inner: &Arc<Self>, peer: &Path, bytes: Vec<u8>) {
        let mut clients = lock(&inner.reply_clients);
        if !clients.contains_key(peer) {
            let client = Client::new(
                &inner.dispatcher,
                ClientConfig::new(peer).with_buffer_size(inner.buffer_size),
            );

            let weak: Weak<Self> = Arc::downgrade(inner);
            let peer_owned = peer.to_path_buf();
            client.closed().connect(move |_| {
                if let Some(manager) = weak.upgrade() {
                    lock(&manager.reply_clients).remove(&peer_owned);
                }
            });

            client.async_start();
            clients.insert(peer.to_path_buf(), client);
        }

        if let Some(client) = clients.get(peer) {
            client.async_send(bytes);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
