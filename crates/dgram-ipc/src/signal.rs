//! Typed event channels for endpoint signals.
//!
//! A [`Signal`] is a list of subscriber callbacks invoked in registration
//! order on the dispatcher. Emission is fire-and-forget: the emitting I/O
//! task posts one capture to the dispatcher and moves on. Subscribers must
//! not block — they share the dispatcher with every other callback.

use std::sync::{Arc, Mutex, PoisonError};

use crate::dispatcher::Dispatcher;

type Slot<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A fire-and-forget event channel carrying values of type `T`.
///
/// Subscribers receive a shared reference to the emitted value and run in
/// the order they were connected.
pub struct Signal<T> {
    dispatcher: Dispatcher,
    slots: Arc<Mutex<Vec<Slot<T>>>>,
}

impl<T: Send + 'static> Signal<T> {
    pub(crate) fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            slots: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers a subscriber. Subscribers cannot be removed; they live as
    /// long as the signal.
    pub fn connect(&self, slot: impl Fn(&T) + Send + Sync + 'static) {
        self.lock().push(Arc::new(slot));
    }

    /// Emits `value` to every subscriber, serialized on the dispatcher.
    pub(crate) fn emit(&self, value: T) {
        let slots = self.lock().clone();
        if slots.is_empty() {
            return;
        }

        self.dispatcher.enqueue(move || {
            for slot in &slots {
                slot(&value);
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Slot<T>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn subscribers_run_in_registration_order() {
        let dispatcher = Dispatcher::new();
        let signal: Signal<u32> = Signal::new(dispatcher);
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let log = Arc::clone(&log);
            signal.connect(move |value: &u32| {
                log.lock().unwrap().push(format!("{tag}{value}"));
            });
        }

        signal.emit(1);
        signal.emit(2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a1", "b1", "c1", "a2", "b2", "c2"]
        );
    }

    #[tokio::test]
    async fn emission_without_subscribers_is_inert() {
        let dispatcher = Dispatcher::new();
        let signal: Signal<Vec<u8>> = Signal::new(dispatcher);
        signal.emit(vec![1, 2, 3]);

        // Late subscribers do not see earlier emissions.
        let count = Arc::new(AtomicUsize::new(0));
        let count_in = Arc::clone(&count);
        signal.connect(move |_| {
            count_in.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
