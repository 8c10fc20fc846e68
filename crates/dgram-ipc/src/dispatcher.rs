//! The dispatcher: a single serialization context for user-visible callbacks.
//!
//! Every endpoint marshals its signals, completion callbacks, and reconnect
//! scheduling through one [`Dispatcher`], so user code observes a single
//! consumer regardless of how many I/O tasks feed it. Tasks run strictly in
//! enqueue order; timed tasks run when their deadline expires, interleaved
//! with the immediate queue.
//!
//! # Interface
//!
//! - [`Dispatcher::enqueue`] — run a task as soon as the queue reaches it.
//! - [`Dispatcher::enqueue_at`] — run a task at (or after) a time point.
//! - [`Dispatcher::when_now`] — the dispatcher's notion of "now".
//! - [`Timer`] — a scoped periodic timer whose callback runs on the
//!   dispatcher; stopped on drop.
//!
//! Tasks must not block: they share one serialization context with every
//! other user-visible callback in the process.

use std::future::poll_fn;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::time::DelayQueue;
use tracing::trace;

type Task = Box<dyn FnOnce() + Send>;

enum Job {
    Now(Task),
    At(Instant, Task),
}

/// Handle to the shared serialization context.
///
/// Cheap to clone; the worker stops once every handle is dropped and the
/// immediate queue has drained. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

impl Dispatcher {
    /// Creates a dispatcher and spawns its worker.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(rx));
        Self { tx }
    }

    /// Enqueues `task` to run in FIFO order.
    ///
    /// Silently a no-op once the worker has stopped; by then no user code is
    /// listening either.
    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Job::Now(Box::new(task)));
    }

    /// Enqueues `task` to run at (or as soon as possible after) `when`.
    pub fn enqueue_at(&self, task: impl FnOnce() + Send + 'static, when: Instant) {
        let _ = self.tx.send(Job::At(when, Box::new(task)));
    }

    /// The time point "now", for composing `enqueue_at` deadlines.
    #[must_use]
    pub fn when_now(&self) -> Instant {
        Instant::now()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<Job>) {
    let mut delayed: DelayQueue<Task> = DelayQueue::new();

    loop {
        tokio::select! {
            job = rx.recv() => match job {
                Some(Job::Now(task)) => task(),
                Some(Job::At(when, task)) => {
                    delayed.insert_at(task, when);
                }
                // All handles dropped: pending timed tasks die with us.
                None => break,
            },
            Some(expired) = poll_fn(|cx| delayed.poll_expired(cx)) => {
                expired.into_inner()();
            }
        }
    }

    trace!("dispatcher worker stopped");
}

/// A scoped periodic timer.
///
/// `start` fires the callback immediately and then once per interval, each
/// firing marshalled onto the dispatcher. Restarting replaces the previous
/// schedule; the timer stops on [`Timer::stop`] or drop.
pub struct Timer {
    dispatcher: Dispatcher,
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    /// Creates a stopped timer bound to `dispatcher`.
    #[must_use]
    pub fn new(dispatcher: &Dispatcher) -> Self {
        Self {
            dispatcher: dispatcher.clone(),
            handle: None,
        }
    }

    /// Starts (or restarts) the timer with the given interval.
    pub fn start(&mut self, interval: Duration, callback: impl Fn() + Send + Sync + 'static) {
        self.stop();

        let dispatcher = self.dispatcher.clone();
        let callback = std::sync::Arc::new(callback);
        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let callback = std::sync::Arc::clone(&callback);
                dispatcher.enqueue(move || callback());
            }
        }));
    }

    /// Stops the timer. Idempotent.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// `true` while a schedule is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn tasks_run_in_enqueue_order() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..10 {
            let log = Arc::clone(&log);
            dispatcher.enqueue(move || log.lock().unwrap().push(i));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn timed_tasks_fire_after_their_deadline() {
        let dispatcher = Dispatcher::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_in = Arc::clone(&fired);
        let at = dispatcher.when_now() + Duration::from_millis(50);
        dispatcher.enqueue_at(
            move || {
                fired_in.fetch_add(1, Ordering::SeqCst);
            },
            at,
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timer_ticks_until_stopped() {
        let dispatcher = Dispatcher::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        let mut timer = Timer::new(&dispatcher);
        let ticks_in = Arc::clone(&ticks);
        timer.start(Duration::from_millis(20), move || {
            ticks_in.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(110)).await;
        timer.stop();
        // Let an already-enqueued firing drain before reading the count.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let observed = ticks.load(Ordering::SeqCst);
        assert!(observed >= 3, "expected >= 3 ticks, got {observed}");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), observed);
    }

    #[tokio::test]
    async fn restarting_a_timer_replaces_the_schedule() {
        let dispatcher = Dispatcher::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let mut timer = Timer::new(&dispatcher);
        let first_in = Arc::clone(&first);
        timer.start(Duration::from_millis(10), move || {
            first_in.fetch_add(1, Ordering::SeqCst);
        });
        let second_in = Arc::clone(&second);
        timer.start(Duration::from_millis(10), move || {
            second_in.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        let first_count = first.load(Ordering::SeqCst);
        assert!(first_count <= 1, "old schedule kept firing: {first_count}");
        assert!(second.load(Ordering::SeqCst) >= 2);
    }
}
