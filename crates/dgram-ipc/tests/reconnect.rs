//! Reconnect lifecycle: client-before-server, server restarts, socket-file
//! deletion, and pending sends surviving an outage.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dgram_ipc::{Client, ClientConfig, Dispatcher};
use tempfile::tempdir;

use common::{init_tracing, sleep_ms, wait_until, Counter, EchoServer, BUFFER_SIZE};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_retries_until_a_server_appears() {
    init_tracing();
    let dir = tempdir().unwrap();
    let server_path = dir.path().join("server.sock");
    let dispatcher = Dispatcher::new();

    let client = Client::new(
        &dispatcher,
        ClientConfig::new(&server_path)
            .with_buffer_size(BUFFER_SIZE)
            .with_server_check_interval(Duration::from_millis(100))
            .with_reconnect_interval(Duration::from_millis(100)),
    );
    let connected = Counter::new();
    let connect_failed = Counter::new();
    {
        let connected = connected.clone();
        client.connected().connect(move |_| connected.incr());
    }
    {
        let connect_failed = connect_failed.clone();
        client.connect_failed().connect(move |_| connect_failed.incr());
    }

    // No server yet: failures accumulate at the reconnect cadence.
    client.async_start();
    sleep_ms(500).await;
    assert!(
        connect_failed.get() >= 3,
        "expected >= 3 connect failures, got {}",
        connect_failed.get()
    );
    assert_eq!(connected.get(), 0);

    let _server = EchoServer::start(&dispatcher, &server_path, None).await;
    assert!(wait_until(2000, || connected.get() == 1).await);

    // Connection is stable once established.
    sleep_ms(300).await;
    assert_eq!(connected.get(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_reconnects_per_server_restart() {
    init_tracing();
    let dir = tempdir().unwrap();
    let server_path = dir.path().join("server.sock");
    let dispatcher = Dispatcher::new();

    let client = Client::new(
        &dispatcher,
        ClientConfig::new(&server_path)
            .with_client_path(dir.path().join("client.sock"))
            .with_buffer_size(BUFFER_SIZE)
            .with_server_check_interval(Duration::from_millis(100))
            .with_reconnect_interval(Duration::from_millis(100)),
    );
    let connected = Counter::new();
    let closed = Counter::new();
    {
        let connected = connected.clone();
        client.connected().connect(move |_| connected.incr());
    }
    {
        let closed = closed.clone();
        client.closed().connect(move |_| closed.incr());
    }
    client.async_start();

    for round in 1..=3 {
        let server = EchoServer::start(&dispatcher, &server_path, None).await;
        assert!(
            wait_until(3000, || connected.get() == round).await,
            "round {round}: expected connect #{round}, got {}",
            connected.get()
        );

        // Server goes away; the probe turns the silence into a close.
        drop(server);
        assert!(
            wait_until(3000, || closed.get() == round).await,
            "round {round}: expected close #{round}, got {}",
            closed.get()
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pending_sends_survive_an_outage() {
    init_tracing();
    let dir = tempdir().unwrap();
    let server_path = dir.path().join("server.sock");
    let dispatcher = Dispatcher::new();

    let client = Client::new(
        &dispatcher,
        ClientConfig::new(&server_path)
            .with_buffer_size(BUFFER_SIZE)
            .with_server_check_interval(Duration::from_millis(100))
            .with_reconnect_interval(Duration::from_millis(100)),
    );
    client.async_start();
    sleep_ms(200).await;

    // Queued while no server exists.
    client.async_send(vec![9u8; 1024]);
    sleep_ms(200).await;

    let server = EchoServer::start(&dispatcher, &server_path, None).await;
    assert!(
        wait_until(3000, || server.received_bytes.get() == 1024).await,
        "queued datagram delivered after reconnect, got {} bytes",
        server.received_bytes.get()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_detects_socket_file_deletion_and_rebinds() {
    init_tracing();
    let dir = tempdir().unwrap();
    let server_path = dir.path().join("server.sock");
    let dispatcher = Dispatcher::new();

    let server = EchoServer::start(
        &dispatcher,
        &server_path,
        Some(Duration::from_millis(100)),
    )
    .await;
    assert!(wait_until(1000, || server.bound.get() == 1).await);
    assert!(server_path.exists());

    // Pull the socket file out from under the server.
    std::fs::remove_file(&server_path).unwrap();

    assert!(
        wait_until(2000, || server.closed.get() >= 1).await,
        "self-probe notices the missing file"
    );
    assert!(
        wait_until(2000, || server.bound.get() >= 2).await,
        "wrapper re-binds"
    );
    assert!(wait_until(1000, || server_path.exists()).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_silences_the_endpoint() {
    init_tracing();
    let dir = tempdir().unwrap();
    let server_path = dir.path().join("server.sock");
    let dispatcher = Dispatcher::new();
    let _server = EchoServer::start(&dispatcher, &server_path, None).await;

    let client = Client::new(
        &dispatcher,
        ClientConfig::new(&server_path)
            .with_buffer_size(BUFFER_SIZE)
            .with_server_check_interval(Duration::from_millis(100))
            .with_reconnect_interval(Duration::from_millis(100)),
    );
    let connected = Counter::new();
    let closed = Counter::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let connected = connected.clone();
        let events = Arc::clone(&events);
        client.connected().connect(move |_| {
            connected.incr();
            events.lock().unwrap().push("connected");
        });
    }
    {
        let closed = closed.clone();
        let events = Arc::clone(&events);
        client.closed().connect(move |_| {
            closed.incr();
            events.lock().unwrap().push("closed");
        });
    }
    {
        let events = Arc::clone(&events);
        client.connect_failed().connect(move |_| {
            events.lock().unwrap().push("connect_failed");
        });
    }

    client.async_start();
    assert!(wait_until(2000, || connected.get() == 1).await);

    // Stop: exactly one closed, then silence despite the reconnect interval.
    client.async_stop();
    assert!(wait_until(1000, || closed.get() == 1).await);
    sleep_ms(500).await;

    assert_eq!(*events.lock().unwrap(), vec!["connected", "closed"]);
}
