//! The cooperative send pipeline.
//!
//! One pipeline instance lives inside each I/O actor. `drive` drains the
//! shared queue head-first until it runs dry, a retry delay is requested, or
//! a fatal error demands a close. The actor re-enters `drive` on every wake
//! (new entries) and when an armed backoff expires, so sends never fan out to
//! other tasks and never starve the actor's receive loop.
//!
//! Error policy per entry (see the crate error taxonomy):
//!
//! - `ENOBUFS`: bounded retry. More than [`NO_BUFFER_SPACE_STALL_LIMIT`]
//!   attempts with zero progress, or more than
//!   [`NO_BUFFER_SPACE_TOTAL_LIMIT`] attempts overall, drops the entry with
//!   `error_occurred`. Either way the next attempt waits
//!   [`NO_BUFFER_SPACE_RETRY_DELAY`].
//! - `EMSGSIZE`: drop the entry, keep the connection.
//! - Anything else, or a send exceeding [`SEND_DEADLINE`]: keep the entry,
//!   close the connection.

use std::path::Path;

use tokio::net::UnixDatagram;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    IoEvent, NO_BUFFER_SPACE_RETRY_DELAY, NO_BUFFER_SPACE_STALL_LIMIT,
    NO_BUFFER_SPACE_TOTAL_LIMIT, SEND_DEADLINE,
};
use crate::dispatcher::Dispatcher;
use crate::entry::{SendEntry, SendQueue};
use crate::error::{classify_send_error, Error, SendErrorClass};

/// Outcome of one `drive` cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendCycleStatus {
    /// Queue drained; wait for the next wake.
    Idle,
    /// Backpressure: resume the queue at the given instant.
    Backoff(Instant),
    /// Connection-fatal error; the actor must close. The failing entry was
    /// returned to the queue head.
    Fatal,
}

pub(crate) struct SendPipeline {
    queue: SendQueue,
    dispatcher: Dispatcher,
    events: mpsc::UnboundedSender<IoEvent>,
}

impl SendPipeline {
    pub fn new(
        queue: SendQueue,
        dispatcher: Dispatcher,
        events: mpsc::UnboundedSender<IoEvent>,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            events,
        }
    }

    /// Runs send attempts against the queue head until it is empty, a delay
    /// is requested, or the connection must close.
    pub async fn drive(&mut self, socket: &UnixDatagram) -> SendCycleStatus {
        loop {
            let Some(mut entry) = self.queue.pop_front() else {
                return SendCycleStatus::Idle;
            };

            let destination = entry.destination().map(Path::to_path_buf);
            let remaining = entry.remaining().to_vec();
            let attempt = tokio::time::timeout(SEND_DEADLINE, async {
                match &destination {
                    Some(path) => socket.send_to(&remaining, path).await,
                    None => socket.send(&remaining).await,
                }
            })
            .await;

            match attempt {
                Err(_elapsed) => {
                    warn!(deadline = ?SEND_DEADLINE, "send watchdog expired");
                    self.queue.push_front(entry);
                    self.report(Error::SendDeadlineExceeded(SEND_DEADLINE));
                    return SendCycleStatus::Fatal;
                }
                Ok(Ok(bytes)) => {
                    entry.add_bytes_transferred(bytes);
                    if entry.transfer_complete() {
                        self.complete(entry);
                    } else {
                        self.queue.push_front(entry);
                    }
                }
                Ok(Err(err)) => match classify_send_error(&err) {
                    SendErrorClass::NoBufferSpace => {
                        let count = entry.record_no_buffer_space();
                        let stalled = entry.bytes_transferred() == 0;
                        if count > NO_BUFFER_SPACE_STALL_LIMIT
                            && (stalled || count > NO_BUFFER_SPACE_TOTAL_LIMIT)
                        {
                            debug!(count, stalled, "dropping entry after ENOBUFS budget");
                            self.report(Error::NoBufferSpace);
                            entry.mark_dropped();
                            self.complete(entry);
                        } else {
                            self.queue.push_front(entry);
                        }
                        return SendCycleStatus::Backoff(
                            Instant::now() + NO_BUFFER_SPACE_RETRY_DELAY,
                        );
                    }
                    SendErrorClass::MessageSize => {
                        debug!(len = entry.rest_bytes(), "datagram too large, dropping entry");
                        self.report(Error::MessageTooLong);
                        entry.mark_dropped();
                        self.complete(entry);
                    }
                    SendErrorClass::Fatal => {
                        debug!(error = %err, "fatal send error");
                        self.queue.push_front(entry);
                        self.report(Error::Io(err));
                        return SendCycleStatus::Fatal;
                    }
                },
            }
        }
    }

    /// Finishes an entry: its completion callback runs on the dispatcher, in
    /// enqueue order with every other callback.
    fn complete(&self, mut entry: SendEntry) {
        if let Some(processed) = entry.take_processed() {
            self.dispatcher.enqueue(processed);
        }
    }

    fn report(&self, error: Error) {
        let _ = self.events.send(IoEvent::Error(error));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;
    use crate::entry::SendKind;

    fn pipeline_for(queue: SendQueue) -> (SendPipeline, mpsc::UnboundedReceiver<IoEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SendPipeline::new(queue, Dispatcher::new(), tx), rx)
    }

    /// A connected socket pair backed by real filesystem endpoints.
    fn socket_pair(dir: &std::path::Path) -> (UnixDatagram, std::os::unix::net::UnixDatagram) {
        let path = dir.join("sink.sock");
        let receiver = std::os::unix::net::UnixDatagram::bind(&path).expect("bind");
        let sender = std::os::unix::net::UnixDatagram::unbound().expect("socket");
        sender.connect(&path).expect("connect");
        sender.set_nonblocking(true).expect("nonblocking");
        (UnixDatagram::from_std(sender).expect("tokio socket"), receiver)
    }

    #[tokio::test]
    async fn drains_queue_and_runs_processed_in_order() {
        let dir = tempdir().expect("tempdir");
        let (socket, receiver) = socket_pair(dir.path());

        let queue = SendQueue::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..3u8 {
            let order = Arc::clone(&order);
            queue.push_back(
                SendEntry::new(SendKind::UserData, &[i]).with_processed(move || {
                    order.lock().unwrap().push(i);
                }),
            );
        }

        let (mut pipeline, _events) = pipeline_for(queue.clone());
        assert_eq!(pipeline.drive(&socket).await, SendCycleStatus::Idle);
        assert!(queue.is_empty());

        let mut buf = [0u8; 16];
        for i in 0..3u8 {
            let n = receiver.recv(&mut buf).expect("datagram");
            assert_eq!(&buf[..n], &[SendKind::UserData.tag(), i]);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn fatal_send_error_keeps_the_entry_and_reports() {
        let dir = tempdir().expect("tempdir");
        let (socket, receiver) = socket_pair(dir.path());
        // Receiver gone: the next send gets a connection error.
        drop(receiver);
        let _ = std::fs::remove_file(dir.path().join("sink.sock"));

        let queue = SendQueue::new();
        let processed = Arc::new(AtomicUsize::new(0));
        let processed_in = Arc::clone(&processed);
        queue.push_back(
            SendEntry::new(SendKind::UserData, &[7]).with_processed(move || {
                processed_in.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let (mut pipeline, mut events) = pipeline_for(queue.clone());
        assert_eq!(pipeline.drive(&socket).await, SendCycleStatus::Fatal);

        // Entry survives for the next connection.
        assert_eq!(queue.len(), 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(processed.load(Ordering::SeqCst), 0);

        match events.try_recv().expect("error event") {
            IoEvent::Error(Error::Io(_)) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn idle_on_empty_queue() {
        let dir = tempdir().expect("tempdir");
        let (socket, _receiver) = socket_pair(dir.path());
        let (mut pipeline, _events) = pipeline_for(SendQueue::new());
        assert_eq!(pipeline.drive(&socket).await, SendCycleStatus::Idle);
    }
}
