//! Shared harness for endpoint integration tests.
//!
//! Each test isolates its socket files in a `tempfile` directory and
//! observes endpoints through counting subscribers; scenarios use real
//! sockets and real time, so assertions allow generous settling sleeps.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dgram_ipc::{Dispatcher, Server, ServerConfig};

/// Buffer size used by the scenario tests.
pub const BUFFER_SIZE: usize = 32 * 1024;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

pub async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Polls `predicate` every 20 ms until it holds or `timeout_ms` elapses.
pub async fn wait_until(timeout_ms: u64, predicate: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep_ms(20).await;
    }
}

/// Shared event counter for subscriber closures.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: usize) {
        self.0.fetch_add(n, Ordering::SeqCst);
    }

    pub fn incr(&self) {
        self.add(1);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

/// An echo server wired with counters, mirroring how applications consume
/// the endpoint signals.
pub struct EchoServer {
    pub server: Server,
    pub bound: Counter,
    pub bind_failed: Counter,
    pub closed: Counter,
    /// Cumulative payload bytes across all received datagrams.
    pub received_bytes: Counter,
    pub errors: Arc<Mutex<Vec<String>>>,
    pub deadline_misses: Arc<Mutex<HashMap<PathBuf, usize>>>,
}

impl EchoServer {
    /// Starts the server and waits for `bound`, so callers can connect
    /// clients without racing the bind.
    pub async fn start(dispatcher: &Dispatcher, path: &Path, reconnect: Option<Duration>) -> Self {
        let mut config = ServerConfig::new(path)
            .with_buffer_size(BUFFER_SIZE)
            .with_server_check_interval(Duration::from_millis(100));
        if let Some(interval) = reconnect {
            config = config.with_reconnect_interval(interval);
        }
        let server = Server::new(dispatcher, config);

        let bound = Counter::new();
        let bind_failed = Counter::new();
        let closed = Counter::new();
        let received_bytes = Counter::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let deadline_misses = Arc::new(Mutex::new(HashMap::new()));

        {
            let bound = bound.clone();
            server.bound().connect(move |_| bound.incr());
        }
        {
            let bind_failed = bind_failed.clone();
            server.bind_failed().connect(move |_| bind_failed.incr());
        }
        {
            let closed = closed.clone();
            server.closed().connect(move |_| closed.incr());
        }
        {
            let errors = Arc::clone(&errors);
            server.error_occurred().connect(move |err| {
                errors.lock().unwrap().push(err.to_string());
            });
        }
        {
            let deadline_misses = Arc::clone(&deadline_misses);
            server
                .next_heartbeat_deadline_exceeded()
                .connect(move |peer| {
                    *deadline_misses
                        .lock()
                        .unwrap()
                        .entry(peer.clone())
                        .or_insert(0) += 1;
                });
        }
        {
            let received_bytes = received_bytes.clone();
            let echo = server.clone_sender();
            server.received().connect(move |event| {
                let (payload, sender) = event;
                received_bytes.add(payload.len());
                if let Some(sender) = sender {
                    echo.async_send(payload, sender.clone());
                }
            });
        }

        server.async_start();

        let this = Self {
            server,
            bound,
            bind_failed,
            closed,
            received_bytes,
            errors,
            deadline_misses,
        };
        assert!(
            wait_until(2000, || this.bound.get() >= 1).await,
            "server failed to bind"
        );
        this
    }
}
