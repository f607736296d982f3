
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use harness::{
    data, eventually, expect_closed, expect_notice, expect_silence, expect_unit, within,
    MemoryCluster, STEP,
};
use hopper_proxy::{
    BackendDirectory, ClientProfile, MemoryEnd, MemoryTransport, Packet, Proxy, ProxyConfig,
    RegistryError, SessionState, UnitSink, UnitSource,
};

#[tokio::test]
async fn active_session_relays_both_directions_in_order() {
    let mut cluster = MemoryCluster::new(&["server1"]);
    let (mut client, handle, mut server1) = cluster.connect_active("server1").await;

    assert_eq!(handle.state(), SessionState::Active);
    assert_eq!(handle.backend().unwrap().name, "server1");

    for i in 0..20 {
        client.send(data(&format!("up-{i}"))).await.unwrap();
    }
    for i in 0..20 {
        assert_eq!(expect_unit(&mut server1).await, data(&format!("up-{i}")));
    }

    for i in 0..20 {
        server1.send(data(&format!("down-{i}"))).await.unwrap();
    }
    for i in 0..20 {
        assert_eq!(expect_unit(&mut client).await, data(&format!("down-{i}")));
    }

    let stats = cluster.proxy.stats();
    assert_eq!(stats.units_client_to_backend.load(Ordering::Relaxed), 20);
    assert_eq!(stats.units_backend_to_client.load(Ordering::Relaxed), 20);
}

#[tokio::test]
async fn backend_receives_client_identity() {
    let mut cluster = MemoryCluster::new(&["server1"]);
    let (_client, _handle) = cluster.connect();
    let accepted = cluster.accept("server1").await;

    assert_eq!(accepted.profile.username.as_deref(), Some("Steve"));
    assert_eq!(accepted.profile.version.as_deref(), Some("1.21.0"));
}

#[tokio::test]
async fn units_sent_while_connecting_are_replayed() {
    let mut cluster = MemoryCluster::new(&["server1"]);
    cluster.backend("server1").hold();

    let (mut client, handle) = cluster.connect();
    client.send(data("early-1")).await.unwrap();
    client.send(data("early-2")).await.unwrap();
    eventually("units buffered", || {
        cluster.proxy.stats().units_buffered.load(Ordering::Relaxed) == 2
    })
    .await;
    assert_eq!(handle.state(), SessionState::Connecting);

    cluster.backend("server1").release();
    let mut server1 = cluster.accept("server1").await.end;
    assert_eq!(expect_unit(&mut server1).await, data("early-1"));
    assert_eq!(expect_unit(&mut server1).await, data("early-2"));
    within("active", handle.wait_until(|s| s.state == SessionState::Active)).await;
}

#[tokio::test]
async fn backend_drop_while_active_closes_client() {
    let mut cluster = MemoryCluster::new(&["server1"]);
    let (mut client, handle, mut server1) = cluster.connect_active("server1").await;

    server1.send(data("last words")).await.unwrap();
    server1.close("restarting").await.unwrap();

    assert_eq!(expect_unit(&mut client).await, data("last words"));
    assert_eq!(
        expect_closed(&mut client).await.as_deref(),
        Some("Server disconnected")
    );
    within("session closed", handle.closed()).await;
    assert!(cluster.proxy.registry().is_empty());

    let names = cluster.observer.names();
    assert_eq!(cluster.observer.count("backend_closed"), 1);
    assert_eq!(names.last().map(String::as_str), Some("session_closed"));
}

#[tokio::test]
async fn backend_error_while_active_closes_client() {
    let mut cluster = MemoryCluster::new(&["server1"]);
    let (mut client, handle, mut server1) = cluster.connect_active("server1").await;

    server1.fail("reset by peer").await.unwrap();

    assert_eq!(expect_closed(&mut client).await.as_deref(), Some("Server error"));
    within("session closed", handle.closed()).await;
    assert!(cluster.proxy.registry().get(&handle.client_id()).is_none());
}

#[tokio::test]
async fn client_close_retires_backend() {
    let mut cluster = MemoryCluster::new(&["server1"]);
    let (mut client, handle, mut server1) = cluster.connect_active("server1").await;

    client.close("quit").await.unwrap();

    assert_eq!(
        expect_closed(&mut server1).await.as_deref(),
        Some("Client disconnected")
    );
    within("session closed", handle.closed()).await;
    assert!(cluster.proxy.registry().is_empty());
    assert_eq!(cluster.observer.count("client_closed"), 1);
    assert_eq!(cluster.observer.count("session_closed"), 1);
}

#[tokio::test]
async fn client_error_retires_backend_with_error_reason() {
    let mut cluster = MemoryCluster::new(&["server1"]);
    let (mut client, handle, mut server1) = cluster.connect_active("server1").await;

    client.fail("broken pipe").await.unwrap();

    assert_eq!(expect_closed(&mut server1).await.as_deref(), Some("Client error"));
    within("session closed", handle.closed()).await;
}

#[tokio::test]
async fn registry_removal_tears_down_and_stops_forwarding() {
    let mut cluster = MemoryCluster::new(&["server1"]);
    let (mut client, handle, mut server1) = cluster.connect_active("server1").await;
    let client_id = handle.client_id();

    assert!(cluster.proxy.registry().remove(&client_id));
    within("session closed", handle.closed()).await;

    assert_eq!(
        expect_closed(&mut client).await.as_deref(),
        Some("Disconnected by proxy")
    );
    assert_eq!(
        expect_closed(&mut server1).await.as_deref(),
        Some("Disconnected by proxy")
    );

    // Nothing the client sends afterwards is forwarded.
    let _ = client.send(data("after removal")).await;
    expect_silence(&mut server1).await;

    assert!(!cluster.proxy.registry().remove(&client_id));
    assert_eq!(cluster.observer.count("session_closed"), 1);
    assert_eq!(cluster.proxy.stats().sessions_closed.load(Ordering::Relaxed), 1);
    assert_eq!(cluster.proxy.stats().sessions_active.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn teardown_happens_once_when_both_sides_close() {
    let mut cluster = MemoryCluster::new(&["server1"]);
    let (mut client, handle, mut server1) = cluster.connect_active("server1").await;

    client.close("quit").await.unwrap();
    let _ = server1.close("bye").await;
    cluster.proxy.registry().remove(&handle.client_id());

    within("session closed", handle.closed()).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(cluster.observer.count("session_closed"), 1);
    assert_eq!(cluster.proxy.stats().sessions_closed.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn initial_connect_failure_notifies_and_closes() {
    let mut cluster = MemoryCluster::new(&["server1"]);
    cluster.backend("server1").refuse(true);

    let (mut client, handle) = cluster.connect();

    let notice = expect_notice(&mut client).await;
    assert!(
        notice.starts_with("Could not connect to server server1: "),
        "unexpected notice {notice}"
    );
    assert_eq!(
        expect_closed(&mut client).await.as_deref(),
        Some("Disconnected by proxy")
    );
    within("session closed", handle.closed()).await;
    assert!(cluster.proxy.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn initial_connect_times_out() {
    let config = ProxyConfig {
        connect_timeout: std::time::Duration::from_millis(200),
        ..Default::default()
    };
    let mut cluster = MemoryCluster::with_config(&["server1"], config);
    cluster.backend("server1").hold();

    let (mut client, handle) = cluster.connect();

    let notice = expect_notice(&mut client).await;
    assert!(notice.contains("timed out"), "unexpected notice {notice}");
    within("session closed", handle.closed()).await;
}

#[tokio::test]
async fn no_backends_turns_client_away() {
    let proxy = Proxy::new(
        MemoryTransport::<Packet>::new(),
        Arc::new(BackendDirectory::new()),
        ProxyConfig::default(),
    );
    let (mut client, proxy_side) = proxy.transport().client_pair();

    let result = proxy.attach(ClientProfile::default(), proxy_side.into_connection());
    assert_eq!(result.err(), Some(RegistryError::NoBackendsConfigured));

    assert_eq!(expect_notice(&mut client).await, "No servers are configured.");
    assert!(expect_closed(&mut client).await.is_some());
    assert!(proxy.registry().is_empty());
    assert_eq!(proxy.stats().sessions_rejected.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn shutdown_disconnects_every_session() {
    let mut cluster = MemoryCluster::new(&["server1"]);
    let (mut a, handle_a, _server_a) = cluster.connect_active("server1").await;
    let (mut b, handle_b, _server_b) = cluster.connect_active("server1").await;
    assert_eq!(cluster.proxy.registry().len(), 2);

    cluster.proxy.shutdown();

    within("a closed", handle_a.closed()).await;
    within("b closed", handle_b.closed()).await;
    assert!(expect_closed(&mut a).await.is_some());
    assert!(expect_closed(&mut b).await.is_some());
    assert!(cluster.proxy.registry().is_empty());
}

#[tokio::test]
async fn drain_returns_after_sessions_delivered_their_close() {
    let mut cluster = MemoryCluster::new(&["server1"]);
    let (mut a, _handle_a, mut server_a) = cluster.connect_active("server1").await;
    let (mut b, _handle_b, _server_b) = cluster.connect_active("server1").await;
    assert_eq!(cluster.proxy.running_sessions(), 2);

    assert!(cluster.proxy.drain(STEP).await);
    assert_eq!(cluster.proxy.running_sessions(), 0);

    // Close frames were written before drain returned.
    for end in [&mut a, &mut b] {
        assert!(matches!(end.recv().now_or_never(), Some(Ok(None))));
        assert_eq!(end.close_reason(), Some("Disconnected by proxy"));
    }
    assert!(matches!(server_a.recv().now_or_never(), Some(Ok(None))));
    assert_eq!(server_a.close_reason(), Some("Disconnected by proxy"));
}

#[tokio::test]
async fn stalled_backend_stops_reading_from_client() {
    let config = ProxyConfig {
        relay_queue_capacity: 1,
        ..Default::default()
    };
    let mut cluster = MemoryCluster::with_config(&["server1"], config);
    let (client, handle, mut server1) = cluster.connect_active("server1").await;

    let sent = Arc::new(AtomicUsize::new(0));
    let sender = tokio::spawn({
        let sent = Arc::clone(&sent);
        let mut client = client;
        async move {
            for i in 0..500 {
                client.send(data(&format!("up-{i}"))).await.unwrap();
                sent.fetch_add(1, Ordering::SeqCst);
            }
            client
        }
    });

    // server1 reads nothing yet. Once the channels and the one-slot relay
    // queue are full the session stops pulling from the client.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stalled_at = sent.load(Ordering::SeqCst);
    assert!(stalled_at < 500, "client was never throttled");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sent.load(Ordering::SeqCst), stalled_at);
    assert_eq!(handle.state(), SessionState::Active);
    assert_eq!(cluster.proxy.stats().units_buffered.load(Ordering::Relaxed), 0);

    for i in 0..500 {
        assert_eq!(expect_unit(&mut server1).await, data(&format!("up-{i}")));
    }
    let _client = within("client sends", sender).await.unwrap();
    assert_eq!(sent.load(Ordering::SeqCst), 500);
}

#[tokio::test]
async fn removal_tears_down_session_waiting_on_stalled_client() {
    let config = ProxyConfig {
        relay_queue_capacity: 1,
        drain_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let mut cluster = MemoryCluster::with_config(&["server1"], config);
    let (mut client, handle, server1) = cluster.connect_active("server1").await;
    let MemoryEnd {
        source: mut server1_source,
        sink: mut server1_sink,
    } = server1;

    // The client never reads, so backend output fills every queue towards it.
    let flood = tokio::spawn(async move {
        for i in 0..500 {
            if server1_sink.send(data(&format!("down-{i}"))).await.is_err() {
                break;
            }
        }
    });
    eventually("client queue full", || {
        cluster
            .proxy
            .stats()
            .units_backend_to_client
            .load(Ordering::Relaxed)
            >= 60
    })
    .await;

    // The reply notice cannot be queued, so the session waits on the client.
    client.send(Packet::text("/transfer nowhere")).await.unwrap();
    eventually("directive rejected", || {
        cluster
            .proxy
            .stats()
            .directives_rejected
            .load(Ordering::Relaxed)
            == 1
    })
    .await;

    assert!(cluster.proxy.registry().remove(&handle.client_id()));
    within("session closed", handle.closed()).await;

    assert!(within("backend close", server1_source.recv()).await.unwrap().is_none());
    assert_eq!(server1_source.close_reason(), Some("Disconnected by proxy"));
    within("flood stopped", flood).await.unwrap();

    assert!(cluster.proxy.registry().is_empty());
    assert_eq!(cluster.proxy.stats().sessions_active.load(Ordering::Relaxed), 0);
    eventually("session task finished", || cluster.proxy.running_sessions() == 0).await;
}
