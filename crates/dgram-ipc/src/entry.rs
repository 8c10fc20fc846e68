//! Outbound send entries and the shared send queue.
//!
//! Every outbound datagram is wrapped in a [`SendEntry`] carrying the wire
//! bytes (a 1-byte [`SendKind`] tag followed by the payload), cumulative
//! transfer accounting, the `ENOBUFS` retry counter, an optional completion
//! callback, and — for server-originated sends — a destination path.
//!
//! The 1-byte tag serves two purposes: sending a zero-byte datagram returns
//! `no_buffer_space` after a sleep/wake cycle on some platforms, and the tag
//! is the framing discriminator for probes, heartbeats, and data.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::heartbeat::encode_deadline;

/// Completion callback attached to a send entry.
///
/// Invoked exactly once on the dispatcher when the entry leaves the queue —
/// whether it was sent, dropped by the pipeline, or drained at teardown. It
/// is a completion notice, never a delivery guarantee.
pub type ProcessedCallback = Box<dyn FnOnce() + Send>;

/// Wire discriminator carried as the first byte of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SendKind {
    /// Zero-payload liveness probe; never surfaced to the user.
    ServerCheck = 0,
    /// Application payload.
    UserData = 1,
    /// Liveness advertisement carrying the sender's deadline interval.
    Heartbeat = 2,
    /// Application reply payload; surfaced like [`SendKind::UserData`].
    Response = 3,
}

impl SendKind {
    /// Returns the wire tag for this kind.
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Decodes a wire tag. Unknown tags are discarded by receive loops.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::ServerCheck),
            1 => Some(Self::UserData),
            2 => Some(Self::Heartbeat),
            3 => Some(Self::Response),
            _ => None,
        }
    }
}

/// A queued outbound datagram plus retry and completion metadata.
pub struct SendEntry {
    buffer: Vec<u8>,
    bytes_transferred: usize,
    no_buffer_space_count: u32,
    processed: Option<ProcessedCallback>,
    destination: Option<PathBuf>,
}

impl SendEntry {
    /// Creates an entry of `kind` wrapping `payload`.
    #[must_use]
    pub fn new(kind: SendKind, payload: &[u8]) -> Self {
        let mut buffer = Vec::with_capacity(payload.len() + 1);
        buffer.push(kind.tag());
        buffer.extend_from_slice(payload);

        Self {
            buffer,
            bytes_transferred: 0,
            no_buffer_space_count: 0,
            processed: None,
            destination: None,
        }
    }

    /// Creates a zero-payload liveness probe.
    #[must_use]
    pub fn probe() -> Self {
        Self::new(SendKind::ServerCheck, &[])
    }

    /// Creates a heartbeat advertising the sender's deadline interval.
    #[must_use]
    pub fn heartbeat(deadline: Duration) -> Self {
        Self::new(SendKind::Heartbeat, &encode_deadline(deadline))
    }

    /// Attaches a completion callback.
    #[must_use]
    pub fn with_processed(mut self, processed: impl FnOnce() + Send + 'static) -> Self {
        self.processed = Some(Box::new(processed));
        self
    }

    /// Addresses the entry to an explicit peer path (server-side sends).
    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// The wire kind, decoded from the tag byte.
    #[must_use]
    pub fn kind(&self) -> Option<SendKind> {
        self.buffer.first().copied().and_then(SendKind::from_tag)
    }

    /// The slice still to be handed to the next send syscall.
    #[must_use]
    pub fn remaining(&self) -> &[u8] {
        &self.buffer[self.bytes_transferred..]
    }

    /// Records `n` additional transferred bytes, saturating at the buffer
    /// length so `bytes_transferred <= len(buffer)` always holds.
    pub fn add_bytes_transferred(&mut self, n: usize) {
        self.bytes_transferred = (self.bytes_transferred + n).min(self.buffer.len());
    }

    /// Cumulative bytes transferred so far.
    #[must_use]
    pub fn bytes_transferred(&self) -> usize {
        self.bytes_transferred
    }

    /// Bytes not yet transferred.
    #[must_use]
    pub fn rest_bytes(&self) -> usize {
        self.buffer.len() - self.bytes_transferred
    }

    /// `true` once the whole buffer has been accounted for.
    #[must_use]
    pub fn transfer_complete(&self) -> bool {
        self.bytes_transferred == self.buffer.len()
    }

    /// Increments the `ENOBUFS` counter and returns the new value.
    pub fn record_no_buffer_space(&mut self) -> u32 {
        self.no_buffer_space_count += 1;
        self.no_buffer_space_count
    }

    /// Current `ENOBUFS` counter.
    #[must_use]
    pub fn no_buffer_space_count(&self) -> u32 {
        self.no_buffer_space_count
    }

    /// Marks the rest of the buffer transferred so `transfer_complete`
    /// holds. Used when the pipeline drops an entry.
    pub(crate) fn mark_dropped(&mut self) {
        self.bytes_transferred = self.buffer.len();
    }

    /// Takes the completion callback, leaving `None`. Guarantees the
    /// exactly-once contract at the type level.
    pub(crate) fn take_processed(&mut self) -> Option<ProcessedCallback> {
        self.processed.take()
    }

    /// Destination path for server-originated sends.
    #[must_use]
    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }
}

impl fmt::Debug for SendEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendEntry")
            .field("kind", &self.kind())
            .field("len", &self.buffer.len())
            .field("bytes_transferred", &self.bytes_transferred)
            .field("no_buffer_space_count", &self.no_buffer_space_count)
            .field("has_processed", &self.processed.is_some())
            .field("destination", &self.destination)
            .finish()
    }
}

/// Ordered FIFO of [`SendEntry`] values, shared by handle.
///
/// The queue is shared between the reconnect wrapper and the live inner
/// endpoint so pending sends survive a reconnect cycle. Any thread may
/// enqueue; only the endpoint's I/O task dequeues.
#[derive(Clone)]
pub struct SendQueue {
    entries: Arc<Mutex<VecDeque<SendEntry>>>,
}

impl SendQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<SendEntry>> {
        self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Appends an entry.
    pub fn push_back(&self, entry: SendEntry) {
        self.lock().push_back(entry);
    }

    /// Returns an entry to the head (retry / fatal-keep paths).
    pub(crate) fn push_front(&self, entry: SendEntry) {
        self.lock().push_front(entry);
    }

    /// Takes the head entry.
    pub(crate) fn pop_front(&self) -> Option<SendEntry> {
        self.lock().pop_front()
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// `true` when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Empties the queue, returning the entries for the teardown drain.
    pub(crate) fn drain(&self) -> Vec<SendEntry> {
        self.lock().drain(..).collect()
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SendQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendQueue").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn tag_round_trip() {
        for kind in [
            SendKind::ServerCheck,
            SendKind::UserData,
            SendKind::Heartbeat,
            SendKind::Response,
        ] {
            assert_eq!(SendKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(SendKind::from_tag(4), None);
        assert_eq!(SendKind::from_tag(255), None);
    }

    #[test]
    fn entry_prefixes_kind_tag() {
        let entry = SendEntry::new(SendKind::UserData, &[10, 20, 30]);
        assert_eq!(entry.remaining(), &[1, 10, 20, 30]);
        assert_eq!(entry.rest_bytes(), 4);
        assert!(!entry.transfer_complete());
    }

    #[test]
    fn probe_is_a_single_tag_byte() {
        let entry = SendEntry::probe();
        assert_eq!(entry.remaining(), &[0]);
        assert_eq!(entry.kind(), Some(SendKind::ServerCheck));
    }

    #[test]
    fn transfer_accounting_saturates() {
        let mut entry = SendEntry::new(SendKind::UserData, &[1, 2, 3]);
        entry.add_bytes_transferred(2);
        assert_eq!(entry.remaining(), &[2, 3]);
        entry.add_bytes_transferred(100);
        assert!(entry.transfer_complete());
        assert_eq!(entry.rest_bytes(), 0);
    }

    #[test]
    fn mark_dropped_completes_the_entry() {
        let mut entry = SendEntry::new(SendKind::UserData, &[0; 16]);
        entry.add_bytes_transferred(4);
        entry.mark_dropped();
        assert!(entry.transfer_complete());
    }

    #[test]
    fn processed_is_taken_at_most_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = Arc::clone(&calls);
        let mut entry = SendEntry::new(SendKind::UserData, &[])
            .with_processed(move || {
                calls_in.fetch_add(1, Ordering::SeqCst);
            });

        let cb = entry.take_processed().expect("first take");
        cb();
        assert!(entry.take_processed().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queue_preserves_fifo_order_across_handles() {
        let queue = SendQueue::new();
        let other = queue.clone();
        queue.push_back(SendEntry::new(SendKind::UserData, &[1]));
        other.push_back(SendEntry::new(SendKind::UserData, &[2]));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_front().unwrap().remaining(), &[1, 1]);
        assert_eq!(queue.pop_front().unwrap().remaining(), &[1, 2]);
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn push_front_restores_head() {
        let queue = SendQueue::new();
        queue.push_back(SendEntry::new(SendKind::UserData, &[2]));
        queue.push_front(SendEntry::new(SendKind::UserData, &[1]));
        assert_eq!(queue.pop_front().unwrap().remaining(), &[1, 1]);
    }
}
